//! CRC-64 with the Jones polynomial as used by Redis RDB trailers.
//!
//! This is not the ECMA/ISO CRC-64: the polynomial is `0xad93d23594c935a9`,
//! processed bit-reflected with an initial value of 0 and no final xor.

/// Jones polynomial, normal form. The reflected algorithm below works on the
/// bit-reversed constant.
const POLY: u64 = 0xad93_d235_94c9_35a9;

static TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let poly = POLY.reverse_bits();
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ poly
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn checksum(data: &[u8]) -> u64 {
    let mut crc = 0u64;
    for &byte in data {
        crc = TABLE[((crc ^ byte as u64) & 0xff) as usize] ^ (crc >> 8);
    }
    crc
}
