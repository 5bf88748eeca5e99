//! Typed argument marshalling: encode and decode the seven Wayland argument
//! kinds over a byte cursor plus an ancillary fd channel.

use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use smallvec::SmallVec;

/// Inline capacity before an argument list spills to the heap. Most requests
/// and events carry a handful of arguments.
const INLINE_ARGS: usize = 4;

/// A decoded or to-be-encoded argument value.
#[derive(Debug)]
pub enum Argument {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    Str(Option<CString>),
    Object(u32),
    NewId(u32),
    /// Dynamic-interface `new_id` as it appears on the wire of a request:
    /// interface name, version, and the newly allocated id.
    AnyNewId(CString, u32, u32),
    Array(Vec<u8>),
    Fd(OwnedFd),
}

/// The kind of an argument, as declared by the protocol catalogue. Carried
/// separately from [`Argument`] because a signature is known before any
/// value exists (needed to decode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentType {
    Int,
    Uint,
    Fixed,
    Str { nullable: bool },
    Object { nullable: bool },
    NewId,
    AnyNewId,
    Array,
    Fd,
}

/// Signed 24.8 fixed-point number, two's-complement on the wire.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Fixed(pub i32);

impl Fixed {
    pub const ZERO: Self = Self(0);

    pub fn from_f64(v: f64) -> Self {
        Self((v * 256.0).round() as i32)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 256.0
    }

    fn from_raw(raw: u32) -> Self {
        Self(raw as i32)
    }

    fn to_raw(self) -> u32 {
        self.0 as u32
    }
}

impl From<f64> for Fixed {
    fn from(v: f64) -> Self {
        Self::from_f64(v)
    }
}

/// A single wire message: sender/target object id, opcode, and arguments.
#[derive(Debug)]
pub struct Message {
    pub object_id: u32,
    pub opcode: u16,
    pub args: SmallVec<[Argument; INLINE_ARGS]>,
}

/// Errors that can occur while serializing a message into a byte buffer.
#[derive(Debug)]
pub enum MessageWriteError {
    /// The destination buffer is too small to hold the message.
    BufferTooSmall,
    /// A caller-supplied fd could not be `dup()`-ed for sending.
    DupFdFailed(std::io::Error),
}

impl std::fmt::Display for MessageWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferTooSmall => f.write_str("destination buffer too small for message"),
            Self::DupFdFailed(e) => write!(f, "could not dup() a file descriptor: {e}"),
        }
    }
}

impl std::error::Error for MessageWriteError {}

/// Errors that can occur while parsing a message out of a byte buffer.
#[derive(Debug, Clone)]
pub enum MessageParseError {
    /// An `fd`-kind argument was expected but the incoming fd queue was empty.
    MissingFd,
    /// Not enough bytes are available yet; caller should retain and retry
    /// once more data has arrived.
    MissingData,
    /// The frame is structurally invalid (size smaller than the header, or
    /// a string argument is not valid UTF-8/NUL-terminated).
    Malformed,
}

impl std::fmt::Display for MessageParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFd => f.write_str("message references a fd but none is queued"),
            Self::MissingData => f.write_str("message is incomplete"),
            Self::Malformed => f.write_str("message is malformed"),
        }
    }
}

impl std::error::Error for MessageParseError {}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Serialize `msg` into `payload`, appending any `fd` arguments (duplicated)
/// to `fds`. Returns the number of bytes written, header included.
pub fn write_to_buffer(
    msg: &Message,
    payload: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> Result<usize, MessageWriteError> {
    fn write_u32(u: u32, buf: &mut [u8]) -> Result<&mut [u8], MessageWriteError> {
        if buf.len() < 4 {
            return Err(MessageWriteError::BufferTooSmall);
        }
        let (head, tail) = buf.split_at_mut(4);
        head.copy_from_slice(&u.to_ne_bytes());
        Ok(tail)
    }

    fn write_bytes<'a>(
        bytes: &[u8],
        buf: &'a mut [u8],
    ) -> Result<&'a mut [u8], MessageWriteError> {
        let buf = write_u32(bytes.len() as u32, buf)?;
        let padded = pad4(bytes.len());
        if buf.len() < padded {
            return Err(MessageWriteError::BufferTooSmall);
        }
        let (dst, rest) = buf.split_at_mut(padded);
        dst[..bytes.len()].copy_from_slice(bytes);
        for b in &mut dst[bytes.len()..] {
            *b = 0;
        }
        Ok(rest)
    }

    if payload.len() < 8 {
        return Err(MessageWriteError::BufferTooSmall);
    }
    let total_len = payload.len();
    let (header, mut body) = payload.split_at_mut(8);

    for arg in &msg.args {
        body = match arg {
            Argument::Int(i) => write_u32(*i as u32, body)?,
            Argument::Uint(u) => write_u32(*u, body)?,
            Argument::Fixed(f) => write_u32(f.to_raw(), body)?,
            Argument::Str(Some(s)) => write_bytes(s.as_bytes_with_nul(), body)?,
            Argument::Str(None) => write_u32(0, body)?,
            Argument::Object(o) => write_u32(*o, body)?,
            Argument::NewId(n) => write_u32(*n, body)?,
            Argument::AnyNewId(iface, version, new_id) => {
                let b = write_bytes(iface.as_bytes_with_nul(), body)?;
                let b = write_u32(*version, b)?;
                write_u32(*new_id, b)?
            }
            Argument::Array(a) => write_bytes(a, body)?,
            Argument::Fd(fd) => {
                let raw: RawFd = std::os::fd::AsRawFd::as_raw_fd(fd);
                let dup = unsafe { BorrowedFd::borrow_raw(raw) }
                    .try_clone_to_owned()
                    .map_err(MessageWriteError::DupFdFailed)?;
                fds.push(dup);
                body
            }
        };
    }

    let written = total_len - body.len();
    header[0..4].copy_from_slice(&msg.object_id.to_ne_bytes());
    header[4..8].copy_from_slice(&(((written as u32) << 16) | u32::from(msg.opcode)).to_ne_bytes());
    Ok(written)
}

/// Parse a single message from `raw` according to `signature`, consuming fds
/// from `fds` in declaration order. Returns the message and the unused tail
/// of `raw`. `raw` may contain more than one frame; only the first is parsed.
pub fn parse_message<'a>(
    raw: &'a [u8],
    signature: &[ArgumentType],
    fds: &mut VecDeque<OwnedFd>,
) -> Result<(Message, &'a [u8]), MessageParseError> {
    fn read_bytes(len: usize, payload: &[u8]) -> Result<(&[u8], &[u8]), MessageParseError> {
        let padded = pad4(len);
        if padded > payload.len() {
            return Err(MessageParseError::MissingData);
        }
        Ok((&payload[..len], &payload[padded..]))
    }

    if raw.len() < 8 {
        return Err(MessageParseError::MissingData);
    }
    let object_id = u32::from_ne_bytes(raw[0..4].try_into().unwrap());
    let word2 = u32::from_ne_bytes(raw[4..8].try_into().unwrap());
    let opcode = (word2 & 0xffff) as u16;
    let size = (word2 >> 16) as usize;

    if size < 8 {
        return Err(MessageParseError::Malformed);
    }
    if size > raw.len() {
        return Err(MessageParseError::MissingData);
    }

    let fd_count = signature.iter().filter(|t| matches!(t, ArgumentType::Fd)).count();
    if fd_count > fds.len() {
        return Err(MessageParseError::MissingFd);
    }

    let (frame, rest) = raw.split_at(size);
    let mut body = &frame[8..];

    let mut args: SmallVec<[Argument; INLINE_ARGS]> = SmallVec::with_capacity(signature.len());
    for ty in signature {
        let arg = match ty {
            ArgumentType::Fd => {
                let fd = fds.pop_front().ok_or(MessageParseError::MissingFd)?;
                Argument::Fd(fd)
            }
            _ => {
                if body.len() < 4 {
                    return Err(MessageParseError::MissingData);
                }
                let (head, tail) = body.split_at(4);
                let raw_u32 = u32::from_ne_bytes(head.try_into().unwrap());
                body = tail;
                match ty {
                    ArgumentType::Int => Argument::Int(raw_u32 as i32),
                    ArgumentType::Uint => Argument::Uint(raw_u32),
                    ArgumentType::Fixed => Argument::Fixed(Fixed::from_raw(raw_u32)),
                    ArgumentType::Object { .. } => Argument::Object(raw_u32),
                    ArgumentType::NewId => Argument::NewId(raw_u32),
                    ArgumentType::Str { .. } => {
                        let len = raw_u32 as usize;
                        let (bytes, tail) = read_bytes(len, body)?;
                        body = tail;
                        if len == 0 {
                            Argument::Str(None)
                        } else {
                            let cstr =
                                CStr::from_bytes_with_nul(bytes).map_err(|_| MessageParseError::Malformed)?;
                            Argument::Str(Some(cstr.to_owned()))
                        }
                    }
                    ArgumentType::Array => {
                        let len = raw_u32 as usize;
                        let (bytes, tail) = read_bytes(len, body)?;
                        body = tail;
                        Argument::Array(bytes.to_vec())
                    }
                    ArgumentType::AnyNewId => {
                        let len = raw_u32 as usize;
                        let (bytes, tail) = read_bytes(len, body)?;
                        let cstr =
                            CStr::from_bytes_with_nul(bytes).map_err(|_| MessageParseError::Malformed)?;
                        if tail.len() < 8 {
                            return Err(MessageParseError::MissingData);
                        }
                        let version = u32::from_ne_bytes(tail[0..4].try_into().unwrap());
                        let new_id = u32::from_ne_bytes(tail[4..8].try_into().unwrap());
                        body = &tail[8..];
                        Argument::AnyNewId(cstr.to_owned(), version, new_id)
                    }
                    ArgumentType::Fd => unreachable!(),
                }
            }
        };
        args.push(arg);
    }

    Ok((Message { object_id, opcode, args }, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    #[test]
    fn scalar_round_trip() {
        let mut buf = vec![0u8; 256];
        let mut fds = Vec::new();
        let msg = Message {
            object_id: 42,
            opcode: 7,
            args: smallvec::smallvec![
                Argument::Uint(3),
                Argument::Int(-25),
                Argument::Fixed(Fixed::from_f64(-0.25)),
                Argument::Object(88),
                Argument::NewId(56),
            ],
        };
        let n = write_to_buffer(&msg, &mut buf, &mut fds).unwrap();
        let mut fdq = VecDeque::new();
        let (decoded, rest) = parse_message(
            &buf[..n],
            &[
                ArgumentType::Uint,
                ArgumentType::Int,
                ArgumentType::Fixed,
                ArgumentType::Object { nullable: false },
                ArgumentType::NewId,
            ],
            &mut fdq,
        )
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.object_id, 42);
        assert_eq!(decoded.opcode, 7);
        match decoded.args[2] {
            Argument::Fixed(f) => assert!((f.as_f64() - (-0.25)).abs() < 1.0 / 256.0),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn string_round_trip_multiple_of_four() {
        let mut buf = vec![0u8; 64];
        let mut fds = Vec::new();
        // "abcd" -> len+nul = 5, pad to 8
        let s = CString::new("abcd").unwrap();
        let msg = Message { object_id: 1, opcode: 0, args: smallvec::smallvec![Argument::Str(Some(s))] };
        let n = write_to_buffer(&msg, &mut buf, &mut fds).unwrap();
        assert_eq!(n, 8 + 4 + 8);
        let mut fdq = VecDeque::new();
        let (decoded, _) =
            parse_message(&buf[..n], &[ArgumentType::Str { nullable: false }], &mut fdq).unwrap();
        match &decoded.args[0] {
            Argument::Str(Some(s)) => assert_eq!(s.to_str().unwrap(), "abcd"),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn array_has_no_implicit_nul() {
        let mut buf = vec![0u8; 64];
        let mut fds = Vec::new();
        let data = vec![1u8, 2, 3, 4, 5];
        let msg =
            Message { object_id: 1, opcode: 0, args: smallvec::smallvec![Argument::Array(data.clone())] };
        let n = write_to_buffer(&msg, &mut buf, &mut fds).unwrap();
        // header(8) + len(4) + data padded to 8 = 20
        assert_eq!(n, 8 + 4 + 8);
        let mut fdq = VecDeque::new();
        let (decoded, _) = parse_message(&buf[..n], &[ArgumentType::Array], &mut fdq).unwrap();
        match &decoded.args[0] {
            Argument::Array(v) => assert_eq!(v, &data),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn fd_round_trip() {
        let mut buf = vec![0u8; 32];
        let mut fds = Vec::new();
        let (r, _w) = nix::unistd::pipe().unwrap();
        let msg = Message { object_id: 1, opcode: 0, args: smallvec::smallvec![Argument::Fd(r)] };
        let n = write_to_buffer(&msg, &mut buf, &mut fds).unwrap();
        assert_eq!(n, 8); // fd args contribute no payload bytes
        assert_eq!(fds.len(), 1);
        let mut fdq: VecDeque<OwnedFd> = fds.into_iter().collect();
        let (decoded, _) = parse_message(&buf[..n], &[ArgumentType::Fd], &mut fdq).unwrap();
        match decoded.args.into_iter().next().unwrap() {
            Argument::Fd(fd) => {
                let _ = fd.into_raw_fd();
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn header_survives_all_opcodes() {
        for opcode in 0u16..=255 {
            let mut buf = vec![0u8; 16];
            let mut fds = Vec::new();
            let msg = Message { object_id: 7, opcode, args: smallvec::smallvec![] };
            let n = write_to_buffer(&msg, &mut buf, &mut fds).unwrap();
            assert_eq!(n, 8);
            assert_eq!(n % 4, 0);
            let mut fdq = VecDeque::new();
            let (decoded, _) = parse_message(&buf[..n], &[], &mut fdq).unwrap();
            assert_eq!(decoded.opcode, opcode);
        }
    }
}
