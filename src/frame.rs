// https://redis.io/docs/reference/protocol-spec

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Maximum array nesting accepted from a client unless configured otherwise.
pub const DEFAULT_MAX_DEPTH: usize = 128;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    #[error("protocol error; {0}")]
    Protocol(String),
    #[error("protocol error; arrays nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("frame size exceeds limit of {0} bytes")]
    FrameTooLarge(usize),
    #[error("stream ended in the middle of a frame")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the peer sent bytes that are not valid RESP, as opposed to a transport failure.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::InvalidDataType(_)
                | Error::Protocol(_)
                | Error::TooDeep(_)
                | Error::FrameTooLarge(_)
        )
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        Error::Protocol(src.to_string())
    }
}

/// Finds frame boundaries in a byte stream delivered in arbitrary chunks.
///
/// Every byte is inspected once. Lines are collected until their LF, bulk payloads are skipped by
/// their declared length without being looked at (so they may contain anything, CRLF sequences
/// included), and open arrays are tracked as a stack of element counts. A scanner that returned an
/// error must not be fed again.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    max_depth: usize,
    state: State,
    // The line being collected, up to its LF.
    line: Vec<u8>,
    // Elements still expected by each open array, innermost last.
    open: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Line,
    // Bulk payload bytes still to skip.
    Payload(usize),
    // Index of the next expected byte of the CRLF closing a bulk payload.
    Terminator(usize),
}

impl FrameScanner {
    pub fn new(max_depth: usize) -> FrameScanner {
        FrameScanner {
            max_depth,
            state: State::Line,
            line: Vec::new(),
            open: Vec::new(),
        }
    }

    /// Feeds the next bytes of the stream.
    ///
    /// Returns how many bytes of `data` complete the current frame, or `None` when all of `data`
    /// belongs to a frame that is still incomplete. Bytes past the returned count start the next
    /// frame and have not been consumed.
    pub fn scan(&mut self, data: &[u8]) -> Result<Option<usize>, Error> {
        let mut pos = 0;

        while pos < data.len() {
            match self.state {
                State::Line => {
                    let rest = &data[pos..];
                    let newline = match rest.iter().position(|&b| b == b'\n') {
                        Some(newline) => newline,
                        None => {
                            self.line.extend_from_slice(rest);
                            return Ok(None);
                        }
                    };

                    self.line.extend_from_slice(&rest[..=newline]);
                    pos += newline + 1;
                    if self.end_line()? {
                        return Ok(Some(pos));
                    }
                }
                State::Payload(remaining) => {
                    let n = remaining.min(data.len() - pos);
                    pos += n;
                    self.state = match remaining - n {
                        0 => State::Terminator(0),
                        remaining => State::Payload(remaining),
                    };
                }
                State::Terminator(index) => {
                    if data[pos] != CRLF[index] {
                        return Err("bulk string payload is not followed by CRLF".into());
                    }
                    pos += 1;

                    if index + 1 < CRLF.len() {
                        self.state = State::Terminator(index + 1);
                    } else {
                        self.state = State::Line;
                        if self.complete_value() {
                            return Ok(Some(pos));
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    /// Whether the scanner sits on a frame boundary.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Line) && self.line.is_empty() && self.open.is_empty()
    }

    // Interprets a complete line. Returns true if it completed the top-level frame.
    fn end_line(&mut self) -> Result<bool, Error> {
        let line = &self.line;
        if line.len() < CRLF.len() || line[line.len() - 2] != b'\r' {
            return Err("line is not terminated by CRLF".into());
        }

        // The first byte in an RESP-serialized payload always identifies its type.
        let data_type = DataType::try_from(line[0])?;
        let count = match data_type {
            DataType::BulkString | DataType::Array => get_count(line)?,
            DataType::SimpleString | DataType::SimpleError | DataType::Integer => None,
        };
        self.line.clear();

        match (data_type, count) {
            // $<length>\r\n<data>\r\n
            (DataType::BulkString, Some(0)) => self.state = State::Terminator(0),
            (DataType::BulkString, Some(length)) => self.state = State::Payload(length),
            // *<number-of-elements>\r\n<element-1>...<element-n>
            (DataType::Array, Some(count)) if count > 0 => {
                if self.open.len() >= self.max_depth {
                    return Err(Error::TooDeep(self.max_depth));
                }
                self.open.push(count);
            }
            // Self-delimiting lines, nulls and empty arrays.
            _ => return Ok(self.complete_value()),
        }

        Ok(false)
    }

    // Accounts for one finished value. Returns true if it completed the top-level frame.
    fn complete_value(&mut self) -> bool {
        while let Some(remaining) = self.open.last_mut() {
            *remaining -= 1;
            if *remaining > 0 {
                return false;
            }
            self.open.pop();
        }
        true
    }
}

/// Parses the length field of a `$` or `*` line. `None` stands for the RESP2 null value (`-1`).
fn get_count(line: &[u8]) -> Result<Option<usize>, Error> {
    let end = line
        .iter()
        .position(|&b| b == b'\r')
        .ok_or_else(|| Error::from("length field is not terminated by CRLF"))?;

    let count = std::str::from_utf8(&line[1..end])
        .ok()
        .and_then(|field| field.parse::<i64>().ok())
        .ok_or_else(|| Error::from("invalid length field"))?;

    match count {
        -1 => Ok(None),
        count if count < -1 => Err(Error::Protocol(format!(
            "invalid negative length {}",
            count
        ))),
        count => usize::try_from(count)
            .map(Some)
            .map_err(|_| Error::from("length field out of range")),
    }
}

/// Encodes a command as a RESP array of bulk strings, the way clients send commands.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Bytes {
    let mut bytes = BytesMut::new();
    bytes.put_u8(u8::from(DataType::Array));
    bytes.extend_from_slice(args.len().to_string().as_bytes());
    bytes.extend_from_slice(CRLF);
    for arg in args {
        let arg = arg.as_ref();
        bytes.put_u8(u8::from(DataType::BulkString));
        bytes.extend_from_slice(arg.len().to_string().as_bytes());
        bytes.extend_from_slice(CRLF);
        bytes.extend_from_slice(arg);
        bytes.extend_from_slice(CRLF);
    }
    bytes.freeze()
}

/// Whether a raw frame is a simple error reply.
pub fn is_error(frame: &[u8]) -> bool {
    frame.first() == Some(&u8::from(DataType::SimpleError))
}

// Only the RESP2 types are forwarded; RESP3 prefixes are rejected like any other unknown byte.
#[derive(Debug, Clone, Copy)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}
