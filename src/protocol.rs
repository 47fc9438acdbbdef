use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;

use crate::{
    error::{Result, TerminalError},
    types::{Encoding, OutboundMessage},
};

/// Largest payload a single characteristic write may carry
pub const PACKET_SIZE: usize = 20;

/// Render a battery notification for the message log
#[must_use]
pub fn battery_notice(level: u8) -> String {
    format!("Battery level: {level} ")
}

/// Encode an outbound message into the bytes that go on the air
///
/// The line ending is appended before encoding, so under [`Encoding::Hex`] the
/// terminator characters are subject to the same filtering as the rest of the text.
///
/// # Errors
///
/// Returns [`TerminalError::InvalidMessageFormat`] if Hex input contains a character
/// that is neither a hex digit nor an ignorable separator.
pub fn encode(message: &OutboundMessage) -> Result<Bytes> {
    let mut text = String::with_capacity(message.text.len() + 2);
    text.push_str(&message.text);
    text.push_str(message.line_ending.suffix());

    match message.encoding {
        Encoding::Ascii => Ok(Bytes::from(text.into_bytes())),
        Encoding::Hex => hex_to_bytes(&text),
    }
}

/// Pack a string of hex digit pairs into bytes
///
/// Bytes below `'0'` (whitespace, punctuation such as `,` or `-`, line endings) and
/// the bytes of non-ASCII characters are separators and skipped. Any other non-hex
/// character rejects the input. An odd
/// digit count is left-padded with a zero nibble, so `"ABC"` packs as `"0ABC"`.
///
/// # Errors
///
/// Returns [`TerminalError::InvalidMessageFormat`] on a non-hex character.
pub fn hex_to_bytes(text: &str) -> Result<Bytes> {
    let mut nibbles = Vec::with_capacity(text.len() + 1);

    for c in text.bytes() {
        let nibble = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ if c < b'0' || !c.is_ascii() => continue,
            _ => return Err(TerminalError::InvalidMessageFormat),
        };
        nibbles.push(nibble);
    }

    if nibbles.len() % 2 == 1 {
        nibbles.insert(0, 0);
    }

    let mut buf = BytesMut::with_capacity(nibbles.len() / 2);
    for pair in nibbles.chunks_exact(2) {
        buf.put_u8((pair[0] << 4) | pair[1]);
    }

    Ok(buf.freeze())
}

/// Render bytes as uppercase hex pairs, each followed by a space
///
/// The trailing space keeps consecutive notifications separated when they are
/// concatenated into one log entry.
#[must_use]
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .fold(String::with_capacity(data.len() * 3), |mut s, b| {
            let _ = write!(s, "{b:02X} ");
            s
        })
}

/// Split an encoded message into packets of at most [`PACKET_SIZE`] bytes
#[must_use]
pub fn fragment(payload: &Bytes) -> Vec<Bytes> {
    (0..payload.len())
        .step_by(PACKET_SIZE)
        .map(|start| payload.slice(start..payload.len().min(start + PACKET_SIZE)))
        .collect()
}

/// Decode a terminal notification for display
///
/// Under [`Encoding::Hex`] the payload is shown as spaced hex; under
/// [`Encoding::Ascii`] the bytes are shown as text.
#[must_use]
pub fn decode_terminal_payload(value: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Hex => bytes_to_hex(value),
        Encoding::Ascii => String::from_utf8_lossy(value).into_owned(),
    }
}

/// Decode a battery level notification
///
/// Returns `None` for an empty payload.
#[must_use]
pub fn decode_battery_level(value: &[u8]) -> Option<u8> {
    value.first().copied()
}
