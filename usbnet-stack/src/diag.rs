//! RFC 862/863/864 diagnostic services: echo, discard and the character
//! generator. Mostly exercise for the TCP endpoint and the send window.

use crate::tcp::{ConnCtx, ConnState, Event, TcpIo, MAX_PAYLOAD, TCP_WINDOW};

pub(crate) fn echo(io: &mut TcpIo<'_, '_>, event: Event) {
    if let Event::Data(payload) = event {
        io.send(payload);
    }
}

pub(crate) fn discard(_io: &mut TcpIo<'_, '_>, event: Event) {
    // Dropping the payload releases its buffer.
    let _ = event;
}

/// Rotating-pattern state, per connection.
#[derive(Clone, Copy)]
pub struct ChargenState {
    char_phase: u8,
    line_phase: u8,
    pos: u8,
}

impl Default for ChargenState {
    fn default() -> Self {
        Self {
            char_phase: 1,
            line_phase: 2,
            pos: 0,
        }
    }
}

impl ChargenState {
    /// Next byte of the RFC 864 pattern: 72 printable characters per line,
    /// each line starting one character further into the alphabet.
    fn next(&mut self) -> u8 {
        self.pos += 1;
        if self.pos <= 72 {
            let c = b' ' + self.char_phase;
            self.char_phase += 1;
            if self.char_phase == 95 {
                self.char_phase = 0;
            }
            c
        } else if self.pos == 73 {
            b'\r'
        } else {
            self.pos = 0;
            self.char_phase = self.line_phase;
            self.line_phase += 1;
            if self.line_phase == 95 {
                self.line_phase = 0;
            }
            b'\n'
        }
    }
}

/// Pushes rotating lines as fast as the link and the peer's
/// acknowledgements allow.
pub(crate) fn chargen(io: &mut TcpIo<'_, '_>, event: Event) {
    match event {
        Event::Open => {
            *io.ctx() = ConnCtx::Chargen(ChargenState::default());
        }
        Event::Closed => {
            *io.ctx() = ConnCtx::None;
            return;
        }
        Event::Data(_payload) => {} // chargen ignores input; buffer drops here
        Event::Poll => {}
    }

    if io.state() != ConnState::Established {
        return;
    }
    // Pace on the USB queue and stop short of the stale-ack kill window.
    if io.tx_pending() >= 2 {
        return;
    }
    if io.unacked() + MAX_PAYLOAD as u32 > 2 * TCP_WINDOW {
        return;
    }

    let Some(mut payload) = io.allocate(MAX_PAYLOAD) else {
        return;
    };
    let mut state = match io.ctx() {
        ConnCtx::Chargen(state) => *state,
        _ => return,
    };

    while payload.len() < payload.capacity() {
        let byte = state.next();
        payload.append(&[byte]);
    }

    if let ConnCtx::Chargen(slot) = io.ctx() {
        *slot = state;
    }
    io.send(payload);
}
