//! Line codec for the command station's `<...>` ASCII protocol.
//!
//! Outgoing frames come from a fixed vocabulary and are newline terminated.
//! Incoming lines are matched against the power acknowledgements only;
//! anything else the station says is reported as [`Response::Unrecognized`].

use crate::model::PowerState;

pub const COMMAND_TRACKS_ON: &str = "<1>";
pub const COMMAND_TRACKS_OFF: &str = "<0>";
pub const COMMAND_STATE: &str = "<s>";
pub const RESPONSE_STATE_ON: &str = "<p1>";
pub const RESPONSE_STATE_OFF: &str = "<p0>";

const LINE_TERMINATOR: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PowerOn,
    PowerOff,
    QueryState,
}

impl Command {
    pub fn for_state(state: PowerState) -> Self {
        match state {
            PowerState::On => Command::PowerOn,
            PowerState::Off => Command::PowerOff,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Command::PowerOn => COMMAND_TRACKS_ON,
            Command::PowerOff => COMMAND_TRACKS_OFF,
            Command::QueryState => COMMAND_STATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    PowerOnAck,
    PowerOffAck,
    Unrecognized,
}

impl Response {
    pub fn power_state(self) -> Option<PowerState> {
        match self {
            Response::PowerOnAck => Some(PowerState::On),
            Response::PowerOffAck => Some(PowerState::Off),
            Response::Unrecognized => None,
        }
    }
}

/// Encodes a command as the bytes written to the socket.
pub fn encode(command: Command) -> Vec<u8> {
    let token = command.token();
    let mut buf = Vec::with_capacity(token.len() + 1);
    buf.extend_from_slice(token.as_bytes());
    buf.push(LINE_TERMINATOR);
    buf
}

/// Decodes one received line. Non-ASCII bytes are dropped and surrounding
/// whitespace is ignored; the line is never rejected.
pub fn decode_line(raw: &[u8]) -> Response {
    let line = trim_line(raw);
    if ascii_eq(line, RESPONSE_STATE_ON) {
        Response::PowerOnAck
    } else if ascii_eq(line, RESPONSE_STATE_OFF) {
        Response::PowerOffAck
    } else {
        Response::Unrecognized
    }
}

/// Lossy printable form of a received line for logging.
pub fn display_line(raw: &[u8]) -> String {
    trim_line(raw)
        .iter()
        .copied()
        .filter(u8::is_ascii)
        .map(char::from)
        .collect()
}

// Bounds are the first and last bytes that are ASCII and not whitespace, so
// stray non-ASCII bytes at either end do not shield whitespace from trimming.
fn trim_line(raw: &[u8]) -> &[u8] {
    let significant = |b: &u8| b.is_ascii() && !is_line_space(*b);
    match (
        raw.iter().position(significant),
        raw.iter().rposition(significant),
    ) {
        (Some(start), Some(end)) => &raw[start..=end],
        _ => &[],
    }
}

// Vertical tab and the 0x1c..=0x1f separators count as whitespace too;
// `u8::is_ascii_whitespace` leaves them out.
fn is_line_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t'..=b'\r' | 0x1c..=0x1f)
}

fn ascii_eq(line: &[u8], token: &str) -> bool {
    line.iter()
        .copied()
        .filter(u8::is_ascii)
        .eq(token.bytes())
}
