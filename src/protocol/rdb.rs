//! RDB snapshot decoding, based on https://rdb.fnordig.de/file_format.html
//!
//! Only the subset a restore needs is understood: auxiliary fields, database
//! selectors, resize hints, expiry attachments and string values. The decoder
//! works over the whole file as a byte buffer so the trailing CRC-64 can be
//! verified against everything that precedes it.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::crc64;

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_EXPIRE_SECS: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;
const TYPE_STRING: u8 = 0x00;

/// Auxiliary fields worth keeping; everything else a server writes there is
/// noise for a restore.
const RETAINED_AUX: [&str; 4] = ["redis-ver", "redis-bits", "ctime", "used-mem"];

#[derive(Debug, Error)]
pub enum RdbError {
    #[error("not an RDB file: bad magic")]
    BadMagic,
    #[error("invalid version field")]
    BadVersion,
    #[error("unexpected end of file at byte {0}")]
    UnexpectedEof(usize),
    #[error("unsupported string encoding 0x{encoding:02x} at byte {at}")]
    UnsupportedEncoding { encoding: u8, at: usize },
    #[error("unsupported value type 0x{value_type:02x} at byte {at}")]
    UnsupportedValueType { value_type: u8, at: usize },
    #[error("checksum mismatch: stored {stored:016x}, computed {computed:016x}")]
    ChecksumMismatch { stored: u64, computed: u64 },
}

#[derive(Debug)]
pub struct Snapshot {
    pub version: u32,
    pub aux: HashMap<String, String>,
    pub entries: Vec<Entry>,
}

#[derive(Debug)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
    pub expires_at: Option<SystemTime>,
}

pub fn decode(buf: &[u8]) -> Result<Snapshot, RdbError> {
    let mut r = Reader { buf, pos: 0 };
    if r.take(5)? != b"REDIS" {
        return Err(RdbError::BadMagic);
    }
    let version = std::str::from_utf8(r.take(4)?)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or(RdbError::BadVersion)?;

    let mut snapshot = Snapshot {
        version,
        aux: HashMap::new(),
        entries: Vec::new(),
    };
    let mut pending_expiry_ms: Option<u64> = None;

    loop {
        let at = r.pos;
        match r.u8()? {
            OP_AUX => {
                let key = read_string(&mut r)?;
                let value = read_string(&mut r)?;
                if RETAINED_AUX.contains(&key.as_str()) {
                    snapshot.aux.insert(key, value);
                }
            }
            OP_SELECTDB => {
                // only database 0 is served; the index is parsed and dropped
                let _db_index = read_length(&mut r)?;
            }
            OP_RESIZEDB => {
                let _hash_size = read_length(&mut r)?;
                let _expiry_hash_size = read_length(&mut r)?;
            }
            OP_EXPIRE_SECS => {
                pending_expiry_ms = Some(r.u32_le()? as u64 * 1000);
            }
            OP_EXPIRE_MS => {
                pending_expiry_ms = Some(r.u64_le()?);
            }
            TYPE_STRING => {
                let key = read_string(&mut r)?;
                let value = Bytes::from(read_bytes(&mut r)?);
                let expires_at = pending_expiry_ms
                    .take()
                    .map(|ms| SystemTime::UNIX_EPOCH + Duration::from_millis(ms));
                snapshot.entries.push(Entry {
                    key,
                    value,
                    expires_at,
                });
            }
            OP_EOF => {
                verify_checksum(&mut r)?;
                return Ok(snapshot);
            }
            value_type => {
                return Err(RdbError::UnsupportedValueType { value_type, at });
            }
        }
    }
}

/// The terminator may be followed by an 8-byte little-endian CRC-64 (Jones)
/// of everything before it. A file that simply ends at the terminator is
/// accepted without verification.
fn verify_checksum(r: &mut Reader) -> Result<(), RdbError> {
    if r.remaining() != 8 {
        return Ok(());
    }
    let body = &r.buf[..r.pos];
    let stored = r.u64_le()?;
    let computed = crc64::checksum(body);
    if stored != computed {
        return Err(RdbError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, RdbError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(RdbError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RdbError> {
        if self.remaining() < n {
            return Err(RdbError::UnexpectedEof(self.buf.len()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32_le(&mut self) -> Result<u32, RdbError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64_le(&mut self) -> Result<u64, RdbError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

enum LengthEncoding {
    /// Plain byte length.
    Len(u32),
    /// Special string encoding selected by the low 6 bits of the lead byte.
    Special(u8),
}

/// Length encoding dispatches on the top two bits of the lead byte: 6-bit
/// immediate, 14-bit big-endian, 32-bit big-endian, or a special encoding.
fn read_length_encoding(r: &mut Reader) -> Result<LengthEncoding, RdbError> {
    let head = r.u8()?;
    let low6 = head & 0b0011_1111;
    match head >> 6 {
        0b00 => Ok(LengthEncoding::Len(low6 as u32)),
        0b01 => {
            let second = r.u8()?;
            Ok(LengthEncoding::Len(((low6 as u32) << 8) | second as u32))
        }
        0b10 => Ok(LengthEncoding::Len(u32::from_be_bytes(
            r.take(4)?.try_into().unwrap(),
        ))),
        _ => Ok(LengthEncoding::Special(low6)),
    }
}

fn read_length(r: &mut Reader) -> Result<u32, RdbError> {
    let at = r.pos;
    match read_length_encoding(r)? {
        LengthEncoding::Len(len) => Ok(len),
        LengthEncoding::Special(encoding) => {
            Err(RdbError::UnsupportedEncoding { encoding, at })
        }
    }
}

/// A string payload: either length-prefixed raw bytes, or an integer stored
/// in one of the compact encodings and rendered back in decimal.
fn read_bytes(r: &mut Reader) -> Result<Vec<u8>, RdbError> {
    let at = r.pos;
    match read_length_encoding(r)? {
        LengthEncoding::Len(len) => Ok(r.take(len as usize)?.to_vec()),
        LengthEncoding::Special(0) => Ok(r.u8()?.to_string().into_bytes()),
        LengthEncoding::Special(1) => {
            let value = u16::from_le_bytes(r.take(2)?.try_into().unwrap());
            Ok(value.to_string().into_bytes())
        }
        LengthEncoding::Special(2) => Ok(r.u32_le()?.to_string().into_bytes()),
        LengthEncoding::Special(encoding) => {
            Err(RdbError::UnsupportedEncoding { encoding, at })
        }
    }
}

fn read_string(r: &mut Reader) -> Result<String, RdbError> {
    Ok(String::from_utf8_lossy(&read_bytes(r)?).into_owned())
}

/// The RDB a primary sends on FULLRESYNC: a version-11 header, the standard
/// auxiliary fields, no keys, and a valid CRC trailer. 88 bytes.
pub fn empty_rdb() -> Vec<u8> {
    hex_to_bytes(RDB_EMPTY_HEX)
}

const RDB_EMPTY_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    // hex string is of 2 chars per byte
    assert_eq!(hex.len() % 2, 0);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).unwrap();
            u8::from_str_radix(text, 16).unwrap()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rdb(body: &[&[u8]]) -> Vec<u8> {
        let mut buf = b"REDIS0011".to_vec();
        for part in body {
            buf.extend_from_slice(part);
        }
        buf
    }

    #[test]
    fn decodes_synthetic_empty_rdb() {
        let snapshot = decode(&empty_rdb()).unwrap();
        assert_eq!(snapshot.version, 11);
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.aux.get("redis-ver").unwrap(), "7.2.0");
        assert_eq!(snapshot.aux.get("redis-bits").unwrap(), "64");
        assert_eq!(snapshot.aux.get("used-mem").unwrap(), "1098928");
        assert!(snapshot.aux.contains_key("ctime"));
        // aof-base is present in the file but not a retained field
        assert!(!snapshot.aux.contains_key("aof-base"));
    }

    #[test]
    fn decodes_plain_string_entry_without_crc() {
        let buf = rdb(&[&[0x00, 3], b"foo", &[3], b"bar", &[0xFF]]);
        let snapshot = decode(&buf).unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].key, "foo");
        assert_eq!(snapshot.entries[0].value.as_ref(), b"bar");
        assert_eq!(snapshot.entries[0].expires_at, None);
    }

    #[test]
    fn expiry_attaches_to_next_key_only() {
        let expire_ms = 1_700_000_000_000u64;
        let buf = rdb(&[
            &[0xFC],
            &expire_ms.to_le_bytes(),
            &[0x00, 1],
            b"a",
            &[1],
            b"1",
            &[0x00, 1],
            b"b",
            &[1],
            b"2",
            &[0xFF],
        ]);
        let snapshot = decode(&buf).unwrap();
        assert_eq!(
            snapshot.entries[0].expires_at,
            Some(SystemTime::UNIX_EPOCH + Duration::from_millis(expire_ms))
        );
        assert_eq!(snapshot.entries[1].expires_at, None);
    }

    #[test]
    fn expiry_in_seconds_scales_to_millis() {
        let buf = rdb(&[
            &[0xFD],
            &1_700_000_000u32.to_le_bytes(),
            &[0x00, 1],
            b"k",
            &[1],
            b"v",
            &[0xFF],
        ]);
        let snapshot = decode(&buf).unwrap();
        assert_eq!(
            snapshot.entries[0].expires_at,
            Some(SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_000))
        );
    }

    #[test]
    fn fourteen_bit_lengths_are_big_endian() {
        let mut long_key = vec![0x00, 0x41, 0x2C]; // (1 << 8) | 44 = 300
        long_key.extend_from_slice(&[b'k'; 300]);
        long_key.extend_from_slice(&[1]);
        long_key.extend_from_slice(b"v");
        let buf = rdb(&[&long_key, &[0xFF]]);
        let snapshot = decode(&buf).unwrap();
        assert_eq!(snapshot.entries[0].key.len(), 300);
    }

    #[test]
    fn thirty_two_bit_lengths_are_big_endian() {
        let buf = rdb(&[
            &[0x00, 0x80, 0, 0, 0, 3],
            b"abc",
            &[1],
            b"v",
            &[0xFF],
        ]);
        let snapshot = decode(&buf).unwrap();
        assert_eq!(snapshot.entries[0].key, "abc");
    }

    #[test]
    fn integer_encoded_values_stringify() {
        let buf = rdb(&[
            &[0x00, 1],
            b"a",
            &[0xC0, 123],
            &[0x00, 1],
            b"b",
            &[0xC1],
            &515u16.to_le_bytes(),
            &[0x00, 1],
            b"c",
            &[0xC2],
            &70000u32.to_le_bytes(),
            &[0xFF],
        ]);
        let snapshot = decode(&buf).unwrap();
        assert_eq!(snapshot.entries[0].value.as_ref(), b"123");
        assert_eq!(snapshot.entries[1].value.as_ref(), b"515");
        assert_eq!(snapshot.entries[2].value.as_ref(), b"70000");
    }

    #[test]
    fn selectdb_and_resizedb_are_skipped() {
        let buf = rdb(&[
            &[0xFE, 0x00],
            &[0xFB, 0x01, 0x00],
            &[0x00, 1],
            b"k",
            &[1],
            b"v",
            &[0xFF],
        ]);
        let snapshot = decode(&buf).unwrap();
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut buf = empty_rdb();
        // flip a byte inside the "redis-ver" aux key; structure still parses
        buf[12] ^= 0x01;
        assert!(matches!(
            decode(&buf),
            Err(RdbError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncated_file_reports_eof() {
        let buf = rdb(&[&[0x00, 3], b"fo"]);
        assert!(matches!(decode(&buf), Err(RdbError::UnexpectedEof(_))));
    }

    #[test]
    fn rejects_bad_magic_and_unknown_value_types() {
        assert!(matches!(decode(b"RUBIS0011\xFF"), Err(RdbError::BadMagic)));
        let buf = rdb(&[&[0x09]]);
        assert!(matches!(
            decode(&buf),
            Err(RdbError::UnsupportedValueType {
                value_type: 0x09,
                ..
            })
        ));
    }

    #[test]
    fn empty_rdb_is_exactly_88_bytes() {
        assert_eq!(empty_rdb().len(), 88);
    }
}
