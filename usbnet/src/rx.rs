//! Streaming reassembly cursor shared by the two class engines.
//!
//! Both class protocols deliver one Ethernet frame per bulk transfer, at a
//! header-declared offset inside the transfer. The cursor tracks the byte
//! stream as 64-byte packets arrive and copies the part overlapping the
//! frame window into the destination buffer.

use crate::buffer::PacketBox;

#[derive(Debug)]
pub(crate) struct TransferWindow {
    transfer_len: usize,
    frame_off: usize,
    frame_len: usize,
    received: usize,
    copied: usize,
}

impl TransferWindow {
    pub(crate) fn new(transfer_len: usize, frame_off: usize, frame_len: usize) -> Self {
        Self {
            transfer_len,
            frame_off,
            frame_len,
            received: 0,
            copied: 0,
        }
    }

    pub(crate) fn transfer_len(&self) -> usize {
        self.transfer_len
    }

    pub(crate) fn frame_off(&self) -> usize {
        self.frame_off
    }

    pub(crate) fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Accounts for one bulk packet and copies the slice overlapping the
    /// frame window into `buf`. The buffer's length must already cover the
    /// frame.
    pub(crate) fn absorb(&mut self, pkt: &[u8], buf: &mut PacketBox) {
        let start = self.received;
        let end = start + pkt.len();
        let lo = start.max(self.frame_off);
        let hi = end.min(self.frame_off + self.frame_len);
        if lo < hi {
            buf[lo - self.frame_off..hi - self.frame_off]
                .copy_from_slice(&pkt[lo - start..hi - start]);
            self.copied += hi - lo;
        }
        self.received = end;
    }

    /// All declared transfer bytes have been seen.
    pub(crate) fn complete(&self) -> bool {
        self.received >= self.transfer_len
    }

    /// The whole frame window has been copied out.
    pub(crate) fn frame_complete(&self) -> bool {
        self.copied == self.frame_len
    }
}
