//! CRC-16 checksum primitive for wire trailers.
//!
//! Uses the KERMIT parameterization: polynomial 0x1021 in reflected form
//! (0x8408), initial value 0x0000. The reference check value over the
//! ASCII bytes `"123456789"` is 0x2189, which remote implementations
//! depend on for interoperability.

use crc::{Crc, CRC_16_KERMIT};

const CRC16_KERMIT: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// Compute the CRC-16 over a byte slice
pub fn crc16(data: &[u8]) -> u16 {
    CRC16_KERMIT.checksum(data)
}

/// Compute the CRC-16 over several slices as one logical record
pub fn crc16_parts(parts: &[&[u8]]) -> u16 {
    let mut digest = CRC16_KERMIT.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // Published check value for CRC-16/KERMIT
        assert_eq!(crc16(b"123456789"), 0x2189);
    }

    #[test]
    fn test_empty_is_init() {
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn test_parts_match_contiguous() {
        let whole = crc16(b"hello world");
        let split = crc16_parts(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let mut data = b"123456789".to_vec();
        let good = crc16(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                data[byte] ^= 1 << bit;
                assert_ne!(crc16(&data), good);
                data[byte] ^= 1 << bit;
            }
        }
    }
}
