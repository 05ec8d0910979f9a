//! Wire format of the BattlEye RCON protocol.
//!
//! Every datagram is a 7 byte header followed by a payload:
//!
//! ```text
//! 'B' 'E' | crc32 (little endian) | 0xFF | type | ...
//! ```
//!
//! The checksum covers the trailing `0xFF` header byte and the payload. Decoding here is from
//! the client's point of view: it understands what a server sends back.

const MAGIC_B: u8 = 0x42;
const MAGIC_E: u8 = 0x45;
const TRAILER: u8 = 0xFF;
const HEADER_LEN: usize = 7;

const LOGIN: u8 = 0x00;
const COMMAND: u8 = 0x01;
const MESSAGE: u8 = 0x02;

const SPLIT_MARKER: u8 = 0x00;
const LOGIN_SUCCESS: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `password` is only sent by the client, `success` is only set by the server.
    Login { password: String, success: bool },
    Command { seq: u8, text: String },
    /// One fragment of a response too large for a single datagram.
    SplitCommand {
        seq: u8,
        index: u8,
        count: u8,
        data: Vec<u8>,
    },
    /// Unsolicited server message. Sent back with empty text as an acknowledgement.
    Message { seq: u8, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("bad magic bytes")]
    BadMagic,

    #[error("bad header trailer byte {0:#04x}")]
    BadTrailer(u8),

    #[error("checksum mismatch (header {expected:#010x}, computed {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown payload type {0:#04x}")]
    UnknownType(u8),

    #[error("payload truncated")]
    Truncated,
}

impl Payload {
    pub fn seq(&self) -> Option<u8> {
        match self {
            Payload::Login { .. } => None,
            Payload::Command { seq, .. }
            | Payload::SplitCommand { seq, .. }
            | Payload::Message { seq, .. } => Some(*seq),
        }
    }

    pub fn login(password: &str) -> Self {
        Payload::Login {
            password: password.to_string(),
            success: false,
        }
    }

    pub fn command(seq: u8, text: &str) -> Self {
        Payload::Command {
            seq,
            text: text.to_string(),
        }
    }

    pub fn ack(seq: u8) -> Self {
        Payload::Message {
            seq,
            text: String::new(),
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Payload::Login { password, .. } => {
                buf.push(LOGIN);
                buf.extend_from_slice(encode_text(password));
            }
            Payload::Command { seq, text } => {
                buf.extend_from_slice(&[COMMAND, *seq]);
                buf.extend_from_slice(encode_text(text));
            }
            Payload::SplitCommand {
                seq,
                index,
                count,
                data,
            } => {
                buf.extend_from_slice(&[COMMAND, *seq, SPLIT_MARKER, *count, *index]);
                buf.extend_from_slice(data);
            }
            Payload::Message { seq, text } => {
                buf.extend_from_slice(&[MESSAGE, *seq]);
                buf.extend_from_slice(encode_text(text));
            }
        }
    }

    fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let (&kind, body) = data.split_first().ok_or(FrameError::Truncated)?;

        match kind {
            LOGIN => {
                let &flag = body.first().ok_or(FrameError::Truncated)?;
                Ok(Payload::Login {
                    password: String::new(),
                    success: flag == LOGIN_SUCCESS,
                })
            }
            COMMAND => {
                let (&seq, rest) = body.split_first().ok_or(FrameError::Truncated)?;

                // A zero byte right after the sequence number marks a fragment header
                if rest.first() == Some(&SPLIT_MARKER) {
                    if rest.len() < 3 {
                        return Err(FrameError::Truncated);
                    }
                    return Ok(Payload::SplitCommand {
                        seq,
                        count: rest[1],
                        index: rest[2],
                        data: rest[3..].to_vec(),
                    });
                }

                Ok(Payload::Command {
                    seq,
                    text: decode_text(rest),
                })
            }
            MESSAGE => {
                let (&seq, rest) = body.split_first().ok_or(FrameError::Truncated)?;
                Ok(Payload::Message {
                    seq,
                    text: decode_text(rest),
                })
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

impl Packet {
    pub fn new(payload: Payload) -> Self {
        Packet { payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.payload.encode_into(&mut payload);
        frame(&payload)
    }

    /// Decodes a datagram received from the server.
    pub fn decode(datagram: &[u8]) -> Result<Self, FrameError> {
        let payload = unframe(datagram)?;
        Ok(Packet {
            payload: Payload::decode(payload)?,
        })
    }
}

impl From<Payload> for Packet {
    fn from(payload: Payload) -> Self {
        Packet::new(payload)
    }
}

/// Wraps raw payload bytes in a header.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&[MAGIC_B, MAGIC_E]);
    buf.extend_from_slice(&checksum(payload).to_le_bytes());
    buf.push(TRAILER);
    buf.extend_from_slice(payload);
    buf
}

/// Validates the header of a datagram and returns the raw payload bytes behind it.
pub fn unframe(datagram: &[u8]) -> Result<&[u8], FrameError> {
    if datagram.len() <= HEADER_LEN {
        return Err(FrameError::TooShort(datagram.len()));
    }

    let (header, payload) = datagram.split_at(HEADER_LEN);
    if header[0] != MAGIC_B || header[1] != MAGIC_E {
        return Err(FrameError::BadMagic);
    }
    if header[6] != TRAILER {
        return Err(FrameError::BadTrailer(header[6]));
    }

    let expected = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    let actual = checksum(payload);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    Ok(payload)
}

pub fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[TRAILER]);
    hasher.update(payload);
    hasher.finalize()
}

// UTF-8 is a superset of ASCII, so plain ASCII text and the UTF-8 fallback share one
// representation and both directions agree without a marker.
fn encode_text(text: &str) -> &[u8] {
    text.as_bytes()
}

pub(crate) fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: Payload) -> Payload {
        Packet::decode(&Packet::new(payload).encode()).unwrap().payload
    }

    #[test]
    fn command_round_trip() {
        let payload = Payload::command(17, "say -1 hello");
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn non_ascii_text_round_trip() {
        let command = Payload::command(3, "say -1 Привет, выжившие");
        assert_eq!(round_trip(command.clone()), command);

        let message = Payload::Message {
            seq: 250,
            text: "(Global) Сталкер: ёлки".to_string(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn split_fragment_round_trip() {
        let fragment = Payload::SplitCommand {
            seq: 9,
            index: 1,
            count: 3,
            data: b"middle part".to_vec(),
        };
        assert_eq!(round_trip(fragment.clone()), fragment);
    }

    #[test]
    fn checksum_covers_trailer_byte() {
        let bytes = Packet::new(Payload::login("password")).encode();
        let mut expected = crc32fast::Hasher::new();
        expected.update(&[0xFF, 0x00]);
        expected.update(b"password");
        assert_eq!(bytes[2..6], expected.finalize().to_le_bytes());
        assert_eq!(&bytes[..2], b"BE");
        assert_eq!(bytes[6], 0xFF);
    }

    #[test]
    fn login_response_decodes_success_flag() {
        assert_eq!(
            Packet::decode(&frame(&[LOGIN, LOGIN_SUCCESS])).unwrap().payload,
            Payload::Login {
                password: String::new(),
                success: true
            }
        );
        assert_eq!(
            Packet::decode(&frame(&[LOGIN, 0x00])).unwrap().payload,
            Payload::Login {
                password: String::new(),
                success: false
            }
        );
    }

    #[test]
    fn empty_command_is_not_a_fragment() {
        assert_eq!(
            Packet::decode(&frame(&[COMMAND, 4])).unwrap().payload,
            Payload::command(4, "")
        );
    }

    #[test]
    fn corrupted_frames_are_rejected() {
        let mut bytes = Packet::new(Payload::command(1, "players")).encode();

        assert_eq!(
            Packet::decode(&bytes[..5]),
            Err(FrameError::TooShort(5))
        );

        bytes[8] ^= 0x01;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(FrameError::ChecksumMismatch { .. })
        ));
        bytes[8] ^= 0x01;

        bytes[0] = b'X';
        assert_eq!(Packet::decode(&bytes), Err(FrameError::BadMagic));
        bytes[0] = b'B';

        bytes[6] = 0x00;
        assert_eq!(Packet::decode(&bytes), Err(FrameError::BadTrailer(0x00)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            Packet::decode(&frame(&[0x07, 1, 2])),
            Err(FrameError::UnknownType(0x07))
        );
    }

    #[test]
    fn truncated_split_header_is_rejected() {
        assert_eq!(
            Packet::decode(&frame(&[COMMAND, 1, SPLIT_MARKER, 2])),
            Err(FrameError::Truncated)
        );
    }
}
