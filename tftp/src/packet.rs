//! Wire-format definitions for TFTP datagrams.
//!
//! Every datagram exchanged between peers is one of five packet kinds.  This
//! module is responsible for:
//! - Classifying an arbitrary byte buffer into a [`Kind`] using a small
//!   positional grammar (see [`classify`]).
//! - Building the exact byte layout of each packet kind.
//! - Decoding a raw datagram into a typed [`Packet`], rejecting anything the
//!   grammar does not accept.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  RRQ    | 0x00 0x01 | filename | 0x00 | mode | 0x00 |
//!  WRQ    | 0x00 0x02 | filename | 0x00 | mode | 0x00 |
//!  DATA   | 0x00 0x03 | block hi | block lo | payload (0..512) |
//!  ACK    | 0x00 0x04 | block hi | block lo |
//!  ERROR  | 0x00 0x05 | code hi  | code lo  | message | 0x00 |
//! ```
//!
//! # Classification grammar
//!
//! | Token | Matches                                                        |
//! |-------|----------------------------------------------------------------|
//! | `0`   | exactly one zero byte                                          |
//! | `c`   | exactly one byte equal to the kind's opcode                    |
//! | `n`   | exactly one byte of any value                                  |
//! | `x`   | one or more non-zero bytes, ending where the next token matches |
//!
//! A trailing `x` has nothing to stop at, so it swallows the rest of the
//! datagram (zero or more bytes of any value).  That is what lets a DATA
//! payload carry binary content and the empty final block.

use std::fmt;

use thiserror::Error;

/// Opcode byte constants (the second byte of every datagram).
pub mod opcode {
    pub const RRQ: u8 = 1;
    pub const WRQ: u8 = 2;
    pub const DATA: u8 = 3;
    pub const ACK: u8 = 4;
    pub const ERROR: u8 = 5;
}

/// Maximum file content carried by one DATA datagram.
pub const BLOCK_SIZE: usize = 512;

/// Opcode (2) + block number (2).
pub const HEADER_LEN: usize = 4;

/// Largest well-formed datagram: a full DATA block.
pub const MAX_DATAGRAM: usize = HEADER_LEN + BLOCK_SIZE;

/// The only transfer mode this implementation accepts.
pub const OCTET_MODE: &str = "octet";

// ---------------------------------------------------------------------------
// Kind + grammar
// ---------------------------------------------------------------------------

/// Packet kind as determined by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
    /// Anything the grammar does not accept.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// `0`
    Zero,
    /// `c`
    Control,
    /// `n`
    Byte,
    /// `x`
    Run,
}

use Token::{Byte, Control, Run, Zero};

const REQUEST_PATTERN: &[Token] = &[Zero, Control, Run, Zero, Run, Zero];
const DATA_PATTERN: &[Token] = &[Zero, Control, Byte, Byte, Run];
const ACK_PATTERN: &[Token] = &[Zero, Control, Byte, Byte];
const ERROR_PATTERN: &[Token] = &[Zero, Control, Byte, Byte, Run, Zero];

impl Kind {
    /// Every kind that has a wire representation, in classification order.
    pub const KNOWN: [Kind; 5] = [Kind::Rrq, Kind::Wrq, Kind::Data, Kind::Ack, Kind::Error];

    /// The opcode byte for this kind, `None` for [`Kind::Unknown`].
    pub fn opcode(self) -> Option<u8> {
        match self {
            Kind::Rrq => Some(opcode::RRQ),
            Kind::Wrq => Some(opcode::WRQ),
            Kind::Data => Some(opcode::DATA),
            Kind::Ack => Some(opcode::ACK),
            Kind::Error => Some(opcode::ERROR),
            Kind::Unknown => None,
        }
    }

    /// `true` for the two kinds that open a transfer.
    pub fn is_request(self) -> bool {
        matches!(self, Kind::Rrq | Kind::Wrq)
    }

    /// `true` for the kinds that carry a block number.
    pub fn has_block(self) -> bool {
        matches!(self, Kind::Data | Kind::Ack)
    }

    fn pattern(self) -> Option<&'static [Token]> {
        match self {
            Kind::Rrq | Kind::Wrq => Some(REQUEST_PATTERN),
            Kind::Data => Some(DATA_PATTERN),
            Kind::Ack => Some(ACK_PATTERN),
            Kind::Error => Some(ERROR_PATTERN),
            Kind::Unknown => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Rrq => "RRQ",
            Kind::Wrq => "WRQ",
            Kind::Data => "DATA",
            Kind::Ack => "ACK",
            Kind::Error => "ERROR",
            Kind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RRQ" => Ok(Kind::Rrq),
            "WRQ" => Ok(Kind::Wrq),
            "DATA" => Ok(Kind::Data),
            "ACK" => Ok(Kind::Ack),
            "ERROR" => Ok(Kind::Error),
            _ => Err(format!("unknown packet kind: {s}")),
        }
    }
}

/// Classify `buf` into a packet kind.
///
/// Never fails: anything longer than [`MAX_DATAGRAM`] or not accepted by one
/// of the patterns is [`Kind::Unknown`].
pub fn classify(buf: &[u8]) -> Kind {
    if buf.len() > MAX_DATAGRAM {
        return Kind::Unknown;
    }
    Kind::KNOWN
        .iter()
        .copied()
        .find(|kind| match (kind.pattern(), kind.opcode()) {
            (Some(pattern), Some(control)) => match_at(pattern, 0, control, buf, 0),
            _ => false,
        })
        .unwrap_or(Kind::Unknown)
}

/// Backtracking match of `pattern[pi..]` against `buf[bi..]`.
///
/// A match must consume the entire buffer.
fn match_at(pattern: &[Token], pi: usize, control: u8, buf: &[u8], bi: usize) -> bool {
    let Some(token) = pattern.get(pi) else {
        return bi == buf.len();
    };
    match token {
        Zero => buf.get(bi) == Some(&0) && match_at(pattern, pi + 1, control, buf, bi + 1),
        Control => {
            buf.get(bi) == Some(&control) && match_at(pattern, pi + 1, control, buf, bi + 1)
        }
        Byte => bi < buf.len() && match_at(pattern, pi + 1, control, buf, bi + 1),
        // Trailing run: nothing follows, so the remainder is payload.
        Run if pi + 1 == pattern.len() => true,
        Run => {
            let mut end = bi;
            while end < buf.len() && buf[end] != 0 {
                end += 1;
                if match_at(pattern, pi + 1, control, buf, end) {
                    return true;
                }
            }
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Block numbers
// ---------------------------------------------------------------------------

/// Big-endian encoding of a block number.
pub fn encode_block_number(block: u16) -> [u8; 2] {
    block.to_be_bytes()
}

/// Inverse of [`encode_block_number`]; the value is unsigned throughout.
pub fn decode_block_number(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// Block field of a DATA or ACK datagram, `None` for any other kind.
pub fn block_number_of(buf: &[u8]) -> Option<u16> {
    if classify(buf).has_block() {
        Some(decode_block_number([buf[2], buf[3]]))
    } else {
        None
    }
}

/// `true` when `buf` is a DATA datagram whose payload ends the transfer.
pub fn is_terminal_data(buf: &[u8]) -> bool {
    classify(buf) == Kind::Data && buf.len() - HEADER_LEN < BLOCK_SIZE
}

/// Case-insensitive check for the `octet` transfer mode.
pub fn is_octet(mode: &str) -> bool {
    mode.eq_ignore_ascii_case(OCTET_MODE)
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Error codes carried in ERROR datagrams (RFC 1350 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    /// Defined by the protocol, never emitted here.
    FileExists,
    /// Defined by the protocol, never emitted here.
    NoSuchUser,
}

impl ErrorCode {
    /// Values outside 0..=7 collapse to [`ErrorCode::NotDefined`].
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// Standard human-readable text for the code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.to_u16())
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

fn encode_request(op: u8, filename: &str, mode: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + filename.len() + mode.len());
    out.extend_from_slice(&[0, op]);
    out.extend_from_slice(filename.as_bytes());
    out.push(0);
    out.extend_from_slice(mode.as_bytes());
    out.push(0);
    out
}

pub fn encode_rrq(filename: &str, mode: &str) -> Vec<u8> {
    encode_request(opcode::RRQ, filename, mode)
}

pub fn encode_wrq(filename: &str, mode: &str) -> Vec<u8> {
    encode_request(opcode::WRQ, filename, mode)
}

/// DATA datagram; `payload` is expected to be at most [`BLOCK_SIZE`] bytes.
pub fn encode_data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[0, opcode::DATA]);
    out.extend_from_slice(&encode_block_number(block));
    out.extend_from_slice(payload);
    out
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    let [hi, lo] = encode_block_number(block);
    vec![0, opcode::ACK, hi, lo]
}

/// ERROR datagram.  An empty `message` is replaced by the code's standard
/// description so the datagram stays within the grammar.
pub fn encode_error(code: ErrorCode, message: &str) -> Vec<u8> {
    let text = if message.is_empty() {
        code.description()
    } else {
        message
    };
    // NUL would terminate the message early on the receiving side.
    let text: Vec<u8> = text.bytes().filter(|&b| b != 0).collect();
    let mut out = Vec::with_capacity(HEADER_LEN + text.len() + 1);
    out.extend_from_slice(&[0, opcode::ERROR]);
    out.extend_from_slice(&code.to_u16().to_be_bytes());
    out.extend_from_slice(&text);
    out.push(0);
    out
}

// ---------------------------------------------------------------------------
// Typed packet
// ---------------------------------------------------------------------------

/// A decoded, well-formed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: String },
    Wrq { filename: String, mode: String },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    pub fn kind(&self) -> Kind {
        match self {
            Packet::Rrq { .. } => Kind::Rrq,
            Packet::Wrq { .. } => Kind::Wrq,
            Packet::Data { .. } => Kind::Data,
            Packet::Ack { .. } => Kind::Ack,
            Packet::Error { .. } => Kind::Error,
        }
    }

    /// Build an ERROR packet carrying the code's standard description.
    pub fn error(code: ErrorCode) -> Self {
        Packet::Error {
            code,
            message: code.description().to_string(),
        }
    }

    /// Serialise into a newly allocated datagram.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Rrq { filename, mode } => encode_rrq(filename, mode),
            Packet::Wrq { filename, mode } => encode_wrq(filename, mode),
            Packet::Data { block, payload } => encode_data(*block, payload),
            Packet::Ack { block } => encode_ack(*block),
            Packet::Error { code, message } => encode_error(*code, message),
        }
    }

    /// Parse a datagram.
    ///
    /// Returns [`Err`] if the buffer exceeds [`MAX_DATAGRAM`] or is not
    /// accepted by the classification grammar.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() > MAX_DATAGRAM {
            return Err(PacketError::Oversized(buf.len()));
        }

        match classify(buf) {
            Kind::Rrq => {
                let (filename, mode) = split_request(buf);
                Ok(Packet::Rrq { filename, mode })
            }
            Kind::Wrq => {
                let (filename, mode) = split_request(buf);
                Ok(Packet::Wrq { filename, mode })
            }
            Kind::Data => Ok(Packet::Data {
                block: decode_block_number([buf[2], buf[3]]),
                payload: buf[HEADER_LEN..].to_vec(),
            }),
            Kind::Ack => Ok(Packet::Ack {
                block: decode_block_number([buf[2], buf[3]]),
            }),
            Kind::Error => Ok(Packet::Error {
                code: ErrorCode::from_u16(u16::from_be_bytes([buf[2], buf[3]])),
                message: text(&buf[HEADER_LEN..buf.len() - 1]),
            }),
            Kind::Unknown => Err(PacketError::Unrecognized {
                opcode: buf.get(1).copied(),
                len: buf.len(),
            }),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Rrq { filename, mode } => write!(f, "RRQ file={filename:?} mode={mode}"),
            Packet::Wrq { filename, mode } => write!(f, "WRQ file={filename:?} mode={mode}"),
            Packet::Data { block, payload } => {
                write!(f, "DATA block={block} len={}", payload.len())
            }
            Packet::Ack { block } => write!(f, "ACK block={block}"),
            Packet::Error { code, message } => {
                write!(f, "ERROR code={} msg={message:?}", code.to_u16())
            }
        }
    }
}

/// Split a grammar-validated RRQ/WRQ into (filename, mode).
fn split_request(buf: &[u8]) -> (String, String) {
    let body = &buf[2..buf.len() - 1];
    let mut fields = body.splitn(2, |&b| b == 0);
    let filename = fields.next().map(text).unwrap_or_default();
    let mode = fields.next().map(text).unwrap_or_default();
    (filename, mode)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes exceeds the {MAX_DATAGRAM}-byte limit")]
    Oversized(usize),
    #[error("datagram ({len} bytes, opcode {opcode:?}) does not match any packet layout")]
    Unrecognized { opcode: Option<u8>, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn request_roundtrip_keeps_filename_and_mode() {
        for (bytes, kind) in [
            (encode_rrq("boot/pxelinux.0", "octet"), Kind::Rrq),
            (encode_wrq("upload.bin", "OCTET"), Kind::Wrq),
        ] {
            assert_eq!(classify(&bytes), kind);
            match Packet::decode(&bytes).unwrap() {
                Packet::Rrq { filename, mode } => {
                    assert_eq!(filename, "boot/pxelinux.0");
                    assert_eq!(mode, "octet");
                }
                Packet::Wrq { filename, mode } => {
                    assert_eq!(filename, "upload.bin");
                    assert_eq!(mode, "OCTET");
                }
                other => panic!("unexpected packet {other:?}"),
            }
        }
    }

    const NAME_CHARS: &[u8] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789._-/";

    #[test]
    fn random_requests_classify_and_roundtrip() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let len = rng.random_range(1..=200);
            let filename: String = (0..len)
                .map(|_| NAME_CHARS[rng.random_range(0..NAME_CHARS.len())] as char)
                .collect();
            let mode: String = OCTET_MODE
                .chars()
                .map(|c| match rng.random_bool(0.5) {
                    true => c.to_ascii_uppercase(),
                    false => c,
                })
                .collect();

            let (name, m) = (filename.clone(), mode.clone());
            let (bytes, expected) = if rng.random_bool(0.5) {
                (encode_rrq(&filename, &mode), Packet::Rrq { filename: name, mode: m })
            } else {
                (encode_wrq(&filename, &mode), Packet::Wrq { filename: name, mode: m })
            };

            assert_eq!(classify(&bytes), expected.kind(), "{filename:?} {mode:?}");
            let decoded = Packet::decode(&bytes).unwrap();
            assert_eq!(decoded, expected);
            assert_eq!(decoded.encode(), bytes);
            assert!(is_octet(&mode));
        }
    }

    /// Any non-zero bytes fill the filename and mode runs, not just text.
    #[test]
    fn random_binary_requests_classify() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let opcode = if rng.random_bool(0.5) { opcode::RRQ } else { opcode::WRQ };
            let mut bytes = vec![0, opcode];
            for _ in 0..2 {
                let run = rng.random_range(1..=200);
                bytes.extend((0..run).map(|_| rng.random_range(1..=u8::MAX)));
                bytes.push(0);
            }
            let expected = if opcode == opcode::RRQ { Kind::Rrq } else { Kind::Wrq };
            assert_eq!(classify(&bytes), expected, "{bytes:?}");

            // Dropping the final terminator breaks the grammar.
            bytes.pop();
            assert_eq!(classify(&bytes), Kind::Unknown);
        }
    }

    #[test]
    fn request_layout_is_exact() {
        assert_eq!(
            encode_rrq("a", "octet"),
            vec![0, 1, b'a', 0, b'o', b'c', b't', b'e', b't', 0]
        );
    }

    #[test]
    fn block_number_roundtrip_is_unsigned() {
        for n in 0..=u16::MAX {
            assert_eq!(decode_block_number(encode_block_number(n)), n);
        }
        assert_eq!(encode_block_number(0x8001), [0x80, 0x01]);
        assert_eq!(decode_block_number([0xff, 0xfe]), 65534);
    }

    #[test]
    fn data_with_binary_payload_classifies() {
        let payload = [0u8, 0, 7, 0, 255];
        let bytes = encode_data(40000, &payload);
        assert_eq!(classify(&bytes), Kind::Data);
        assert_eq!(
            Packet::decode(&bytes).unwrap(),
            Packet::Data {
                block: 40000,
                payload: payload.to_vec()
            }
        );
    }

    #[test]
    fn empty_final_block_is_data_not_ack() {
        let bytes = encode_data(3, &[]);
        assert_eq!(bytes.len(), HEADER_LEN);
        // Same length as an ACK; the opcode decides.
        assert_eq!(classify(&bytes), Kind::Data);
        assert!(is_terminal_data(&bytes));
        assert!(!is_terminal_data(&encode_data(3, &[1u8; BLOCK_SIZE])));
    }

    #[test]
    fn ack_must_be_exactly_four_bytes() {
        assert_eq!(classify(&encode_ack(7)), Kind::Ack);
        assert_eq!(classify(&[0, 4, 0, 7, 1]), Kind::Unknown);
        assert_eq!(classify(&[0, 4, 0]), Kind::Unknown);
        assert_eq!(block_number_of(&encode_ack(7)), Some(7));
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let mut bytes = encode_data(1, &[9u8; BLOCK_SIZE]);
        assert_eq!(classify(&bytes), Kind::Data);
        bytes.push(9);
        assert_eq!(classify(&bytes), Kind::Unknown);
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::Oversized(MAX_DATAGRAM + 1))
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(classify(&[0, 9, 0, 1]), Kind::Unknown);
        assert_eq!(classify(&[1, 3, 0, 1]), Kind::Unknown);
        assert_eq!(classify(&[]), Kind::Unknown);
        assert!(matches!(
            Packet::decode(&[0, 9, 0, 1]),
            Err(PacketError::Unrecognized { opcode: Some(9), .. })
        ));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        // Empty filename.
        assert_eq!(classify(&[0, 1, 0, b'o', 0]), Kind::Unknown);
        // Missing mode terminator.
        assert_eq!(classify(&[0, 1, b'f', 0, b'o']), Kind::Unknown);
        // Trailing garbage after the mode.
        assert_eq!(classify(&[0, 2, b'f', 0, b'o', 0, b'z']), Kind::Unknown);
        // Empty mode.
        assert_eq!(classify(&[0, 2, b'f', 0, 0]), Kind::Unknown);
    }

    #[test]
    fn error_roundtrip_and_default_message() {
        let bytes = encode_error(ErrorCode::UnknownTransferId, "");
        assert_eq!(&bytes[..4], &[0, 5, 0, 5]);
        assert_eq!(*bytes.last().unwrap(), 0);
        assert_eq!(classify(&bytes), Kind::Error);
        assert_eq!(
            Packet::decode(&bytes).unwrap(),
            Packet::error(ErrorCode::UnknownTransferId)
        );

        let custom = encode_error(ErrorCode::DiskFull, "quota reached");
        assert_eq!(
            Packet::decode(&custom).unwrap(),
            Packet::Error {
                code: ErrorCode::DiskFull,
                message: "quota reached".into()
            }
        );
    }

    #[test]
    fn error_codes_roundtrip() {
        for v in 0..=7u16 {
            assert_eq!(ErrorCode::from_u16(v).to_u16(), v);
        }
        assert_eq!(ErrorCode::from_u16(99), ErrorCode::NotDefined);
    }

    #[test]
    fn mode_check_is_case_insensitive() {
        assert!(is_octet("octet"));
        assert!(is_octet("OcTeT"));
        assert!(!is_octet("netascii"));
        assert!(!is_octet("mail"));
    }

    #[test]
    fn kind_parses_from_rule_text() {
        assert_eq!("data".parse::<Kind>(), Ok(Kind::Data));
        assert_eq!("WRQ".parse::<Kind>(), Ok(Kind::Wrq));
        assert!("oack".parse::<Kind>().is_err());
    }
}
