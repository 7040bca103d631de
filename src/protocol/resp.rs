use std::fmt::Display;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// One RESP2 frame. `Null` covers both the null bulk string (`$-1`) and the
/// null array (`*-1`); it always re-encodes as a null bulk. `Rdb` is the
/// non-RESP blob that follows a `+FULLRESYNC` line: `$<len>\r\n<bytes>` with
/// no trailing CRLF.
#[derive(Debug, Clone, PartialEq)]
pub enum RESP {
    String(String),
    Error(String),
    Int(i64),
    Bulk(Bytes),
    Array(Vec<RESP>),
    Null,
    Rdb(Vec<u8>),
}

impl RESP {
    pub fn bulk(value: impl AsRef<[u8]>) -> RESP {
        RESP::Bulk(Bytes::copy_from_slice(value.as_ref()))
    }

    /// An array-of-bulks request, the shape every command takes on the wire.
    pub fn command(parts: &[&str]) -> RESP {
        RESP::Array(parts.iter().map(RESP::bulk).collect())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode(self, &mut out);
        out
    }
}

impl Display for RESP {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RESP::String(s) => write!(f, "{}", s),
            RESP::Error(s) => write!(f, "!{}", s),
            RESP::Int(i) => write!(f, "{}", i),
            RESP::Bulk(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            RESP::Array(array) => {
                for item in array {
                    write!(f, "{} ", item)?;
                }
                Ok(())
            }
            RESP::Null => write!(f, "null"),
            RESP::Rdb(blob) => write!(f, "rdb[{}]", blob.len()),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// More bytes are needed; the caller keeps its buffer and retries.
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid frame at byte {at}: {reason}")]
    Invalid { at: usize, reason: String },
}

fn invalid(at: usize, reason: impl Into<String>) -> FrameError {
    FrameError::Invalid {
        at,
        reason: reason.into(),
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// `Ok(Some((frame, consumed)))` on success, `Ok(None)` when the buffer holds
/// only a prefix of a frame, `Err` when the bytes can never become a valid
/// frame (the error carries the offending byte position).
pub fn try_parse(buf: &[u8]) -> Result<Option<(RESP, usize)>, FrameError> {
    match parse_at(buf, 0) {
        Ok((frame, end)) => Ok(Some((frame, end))),
        Err(FrameError::Incomplete) => Ok(None),
        Err(err) => Err(err),
    }
}

fn parse_at(buf: &[u8], pos: usize) -> Result<(RESP, usize), FrameError> {
    let Some(&tag) = buf.get(pos) else {
        return Err(FrameError::Incomplete);
    };
    match tag {
        b'+' => {
            let (line, next) = take_line(buf, pos + 1)?;
            Ok((RESP::String(text(line, pos + 1)?), next))
        }
        b'-' => {
            let (line, next) = take_line(buf, pos + 1)?;
            Ok((RESP::Error(text(line, pos + 1)?), next))
        }
        b':' => {
            let (line, next) = take_line(buf, pos + 1)?;
            Ok((RESP::Int(parse_int(line, pos + 1)?), next))
        }
        b'$' => {
            let (line, next) = take_line(buf, pos + 1)?;
            let len = parse_int(line, pos + 1)?;
            if len < 0 {
                return if len == -1 {
                    Ok((RESP::Null, next))
                } else {
                    Err(invalid(pos + 1, format!("invalid bulk length {}", len)))
                };
            }
            let len = len as usize;
            if buf.len() < next + len + 2 {
                return Err(FrameError::Incomplete);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(invalid(next + len, "bulk payload not CRLF terminated"));
            }
            let payload = Bytes::copy_from_slice(&buf[next..next + len]);
            Ok((RESP::Bulk(payload), next + len + 2))
        }
        b'*' => {
            let (line, next) = take_line(buf, pos + 1)?;
            let len = parse_int(line, pos + 1)?;
            if len < 0 {
                return if len == -1 {
                    Ok((RESP::Null, next))
                } else {
                    Err(invalid(pos + 1, format!("invalid array length {}", len)))
                };
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                let (item, end) = parse_at(buf, cursor)?;
                items.push(item);
                cursor = end;
            }
            Ok((RESP::Array(items), cursor))
        }
        other => Err(invalid(
            pos,
            format!("unexpected type byte 0x{:02x}", other),
        )),
    }
}

/// Line sliced up to the next CRLF; `Incomplete` if the terminator has not
/// arrived yet.
fn take_line(buf: &[u8], start: usize) -> Result<(&[u8], usize), FrameError> {
    if start > buf.len() {
        return Err(FrameError::Incomplete);
    }
    match buf[start..].windows(2).position(|w| w == b"\r\n") {
        Some(rel) => Ok((&buf[start..start + rel], start + rel + 2)),
        None => Err(FrameError::Incomplete),
    }
}

fn text(line: &[u8], at: usize) -> Result<String, FrameError> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| invalid(at, "line is not valid utf-8"))
}

/// RESP2 integers are decoded with an optional `+` or `-`; encoding emits a
/// sign only for negative values.
fn parse_int(line: &[u8], at: usize) -> Result<i64, FrameError> {
    let s = std::str::from_utf8(line).map_err(|_| invalid(at, "integer is not valid utf-8"))?;
    let unsigned = s.strip_prefix('+').unwrap_or(s);
    unsigned
        .parse::<i64>()
        .map_err(|_| invalid(at, format!("invalid integer {:?}", s)))
}

pub fn encode(message: &RESP, out: &mut Vec<u8>) {
    match message {
        RESP::String(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RESP::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RESP::Int(n) => {
            out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
        }
        RESP::Bulk(b) => {
            out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
            out.extend_from_slice(b);
            out.extend_from_slice(b"\r\n");
        }
        RESP::Null => {
            out.extend_from_slice(b"$-1\r\n");
        }
        RESP::Array(array) => {
            out.extend_from_slice(format!("*{}\r\n", array.len()).as_bytes());
            for item in array {
                encode(item, out);
            }
        }
        RESP::Rdb(blob) => {
            out.extend_from_slice(format!("${}\r\n", blob.len()).as_bytes());
            out.extend_from_slice(blob);
        }
    }
}

/// A TCP connection speaking RESP. Reads accumulate into a buffer so a frame
/// can arrive split across any number of segments, and pipelined requests are
/// consumed one frame at a time.
pub struct RespConnection {
    stream: TcpStream,
    buf: BytesMut,
}

impl RespConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        Ok(self.stream.read_timeout()?)
    }

    /// Block until one complete frame is available. Returns the decoded frame
    /// together with its raw wire bytes; `raw.len()` is the exact byte length
    /// used for replication offset accounting, and `raw` itself is what a
    /// primary forwards to followers.
    pub fn read_frame(&mut self) -> Result<(Bytes, RESP)> {
        loop {
            match try_parse(&self.buf) {
                Ok(Some((frame, consumed))) => {
                    let raw = self.buf.split_to(consumed).freeze();
                    return Ok((raw, frame));
                }
                Ok(None) => self.fill()?,
                Err(err) => bail!("protocol error: {}", err),
            }
        }
    }

    /// Raw-read mode for the bulk RDB blob after `+FULLRESYNC`: expects
    /// `$<len>\r\n` followed by exactly `len` bytes with no trailing CRLF.
    pub fn read_rdb_blob(&mut self) -> Result<Vec<u8>> {
        let line = self.read_line()?;
        let Some(len) = line.strip_prefix('$') else {
            bail!("expected RDB bulk header, got {:?}", line);
        };
        let len: usize = len.parse()?;
        while self.buf.len() < len {
            self.fill()?;
        }
        Ok(self.buf.split_to(len).to_vec())
    }

    fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            bail!("connection closed by peer");
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    pub fn send_frame(&mut self, message: &RESP) -> Result<usize> {
        let bytes = message.to_bytes();
        self.stream.write_all(&bytes)?;
        Ok(bytes.len())
    }

    pub fn send_frames(&mut self, messages: &[RESP]) -> Result<usize> {
        let mut len = 0;
        for message in messages {
            len += self.send_frame(message)?;
        }
        Ok(len)
    }

    /// Bytes-identical write, used for forwarding propagated frames.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        Ok(self.stream.write_all(bytes)?)
    }
}
