// src/checksums.rs
//
// Checksum algorithms used to verify the trailing integrity segment of
// extracted frames. Every algorithm yields its checksum as the exact byte
// sequence expected on the wire.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

// ============================================================================
// Types
// ============================================================================

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// No trailing checksum
    #[default]
    None,
    /// XOR of all bytes
    Xor,
    /// sum(bytes) & 0xFF
    Sum8,
    /// CRC-8 polynomial 0x07, init 0x00
    Crc8,
    /// CRC-16 polynomial 0x1021, init 0x0000 (XMODEM), big-endian on the wire
    Crc16,
    /// CRC-16 CCITT-FALSE polynomial 0x1021, init 0xFFFF, big-endian on the wire
    Crc16Ccitt,
    /// CRC-16 Modbus (0x8005 reflected), little-endian on the wire
    Crc16Modbus,
    /// CRC-32 IEEE 802.3 (reflected 0xEDB88320), big-endian on the wire
    Crc32,
    /// Fletcher-16, emitted as [sum2, sum1]
    Fletcher16,
    /// Fletcher-32 over big-endian 16-bit words
    Fletcher32,
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Get the output size in bytes for this algorithm.
    pub fn output_bytes(&self) -> usize {
        match self {
            ChecksumAlgorithm::None => 0,
            ChecksumAlgorithm::Xor | ChecksumAlgorithm::Sum8 | ChecksumAlgorithm::Crc8 => 1,
            ChecksumAlgorithm::Crc16
            | ChecksumAlgorithm::Crc16Ccitt
            | ChecksumAlgorithm::Crc16Modbus
            | ChecksumAlgorithm::Fletcher16 => 2,
            ChecksumAlgorithm::Crc32 | ChecksumAlgorithm::Fletcher32 => 4,
            ChecksumAlgorithm::Md5 => 16,
            ChecksumAlgorithm::Sha1 => 20,
            ChecksumAlgorithm::Sha256 => 32,
        }
    }

    /// Compute the checksum of `data` as wire bytes.
    /// The returned vector is always `output_bytes()` long.
    pub fn compute(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ChecksumAlgorithm::None => Vec::new(),
            ChecksumAlgorithm::Xor => vec![xor_checksum(data)],
            ChecksumAlgorithm::Sum8 => vec![sum8_checksum(data)],
            ChecksumAlgorithm::Crc8 => vec![crc8_checksum(data)],
            ChecksumAlgorithm::Crc16 => crc16_xmodem_checksum(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Crc16Ccitt => crc16_ccitt_checksum(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Crc16Modbus => crc16_modbus_checksum(data).to_le_bytes().to_vec(),
            ChecksumAlgorithm::Crc32 => crc32_checksum(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Fletcher16 => fletcher16_checksum(data).to_vec(),
            ChecksumAlgorithm::Fletcher32 => fletcher32_checksum(data).to_vec(),
            ChecksumAlgorithm::Md5 => Md5::digest(data).to_vec(),
            ChecksumAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            ChecksumAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    /// Check a payload against a checksum segment taken from the wire.
    pub fn verify(&self, payload: &[u8], checksum: &[u8]) -> bool {
        checksum.len() == self.output_bytes() && self.compute(payload) == checksum
    }
}

// ============================================================================
// Reflection Helpers
// ============================================================================

/// Reflect (reverse) the bits of a 16-bit value.
fn reflect16(mut value: u16) -> u16 {
    let mut result: u16 = 0;
    for _ in 0..16 {
        result = (result << 1) | (value & 1);
        value >>= 1;
    }
    result
}

// ============================================================================
// Parameterised CRC Functions
// ============================================================================

/// MSB-first CRC-8 with arbitrary parameters.
///
/// # Arguments
/// * `data` - The data to calculate CRC over
/// * `polynomial` - The CRC polynomial (e.g., 0x07 for standard CRC-8)
/// * `init` - Initial CRC value (e.g., 0x00 or 0xFF)
/// * `xor_out` - Final XOR value (e.g., 0x00 or 0x55)
pub fn crc8_parameterised(data: &[u8], polynomial: u8, init: u8, xor_out: u8) -> u8 {
    let mut crc = init;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ polynomial;
            } else {
                crc <<= 1;
            }
        }
    }
    crc ^ xor_out
}

/// CRC-16 with arbitrary parameters.
///
/// # Arguments
/// * `data` - The data to calculate CRC over
/// * `polynomial` - The CRC polynomial (e.g., 0x8005 for CRC-16)
/// * `init` - Initial CRC value (e.g., 0x0000 or 0xFFFF)
/// * `xor_out` - Final XOR value (e.g., 0x0000 or 0xFFFF)
/// * `reflect` - Whether input and output are reflected (LSB-first)
pub fn crc16_parameterised(
    data: &[u8],
    polynomial: u16,
    init: u16,
    xor_out: u16,
    reflect: bool,
) -> u16 {
    let mut crc = init;

    if reflect {
        let reflected_poly = reflect16(polynomial);
        for &byte in data {
            crc ^= byte as u16;
            for _ in 0..8 {
                if crc & 0x0001 != 0 {
                    crc = (crc >> 1) ^ reflected_poly;
                } else {
                    crc >>= 1;
                }
            }
        }
    } else {
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ polynomial;
                } else {
                    crc <<= 1;
                }
            }
        }
    }

    crc ^ xor_out
}

// ============================================================================
// Named Checksum Functions
// ============================================================================

/// XOR of all bytes.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Simple modulo-256 sum of bytes (8-bit sum).
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC-8 with polynomial 0x07 (ITU/SMBUS).
pub fn crc8_checksum(data: &[u8]) -> u8 {
    crc8_parameterised(data, 0x07, 0x00, 0x00)
}

/// CRC-16 XMODEM: polynomial 0x1021, init 0x0000, not reflected.
pub fn crc16_xmodem_checksum(data: &[u8]) -> u16 {
    crc16_parameterised(data, 0x1021, 0x0000, 0x0000, false)
}

/// CRC-16 CCITT-FALSE: polynomial 0x1021, init 0xFFFF, not reflected.
pub fn crc16_ccitt_checksum(data: &[u8]) -> u16 {
    crc16_parameterised(data, 0x1021, 0xFFFF, 0x0000, false)
}

/// CRC-16 Modbus polynomial (0x8005, reflected).
pub fn crc16_modbus_checksum(data: &[u8]) -> u16 {
    crc16_parameterised(data, 0x8005, 0xFFFF, 0x0000, true)
}

/// CRC-32 (IEEE 802.3, as used by zlib and Ethernet).
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc ^ 0xFFFF_FFFF
}

/// Fletcher-16, returned as `[sum2, sum1]`.
pub fn fletcher16_checksum(data: &[u8]) -> [u8; 2] {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + byte as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    [sum2 as u8, sum1 as u8]
}

/// Fletcher-32 over big-endian 16-bit words. Odd-length input is padded
/// with a trailing zero byte. Returned as sum2 (BE) followed by sum1 (BE).
pub fn fletcher32_checksum(data: &[u8]) -> [u8; 4] {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for word in data.chunks(2) {
        let hi = word[0] as u32;
        let lo = word.get(1).copied().unwrap_or(0) as u32;
        sum1 = (sum1 + ((hi << 8) | lo)) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    let [_, _, s2_hi, s2_lo] = sum2.to_be_bytes();
    let [_, _, s1_hi, s1_lo] = sum1.to_be_bytes();
    [s2_hi, s2_lo, s1_hi, s1_lo]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    // ========================================================================
    // XOR / Sum8
    // ========================================================================

    #[test]
    fn test_xor_checksum_basic() {
        // 0x01 ^ 0x02 ^ 0x03 ^ 0x04 ^ 0x05 = 0x01
        assert_eq!(xor_checksum(&[0x01, 0x02, 0x03, 0x04, 0x05]), 0x01);
        assert_eq!(xor_checksum(&[0xAA, 0x55]), 0xFF);
        assert_eq!(xor_checksum(&[]), 0);
    }

    #[test]
    fn test_sum8_checksum_wrapping() {
        assert_eq!(sum8_checksum(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(sum8_checksum(&[0xFF, 0x02]), 0x01);
    }

    // ========================================================================
    // CRC
    // ========================================================================

    #[test]
    fn test_crc8_checksum_test_vector() {
        assert_eq!(crc8_checksum(CHECK), 0xF4);
        assert_eq!(crc8_checksum(&[]), 0x00);
    }

    #[test]
    fn test_crc8_parameterised_catalogue() {
        // CRC-8/I-432-1 (ITU) and CRC-8/CDMA2000
        assert_eq!(crc8_parameterised(CHECK, 0x07, 0x00, 0x55), 0xA1);
        assert_eq!(crc8_parameterised(CHECK, 0x9B, 0xFF, 0x00), 0xDA);
    }

    #[test]
    fn test_crc16_variants_test_vectors() {
        assert_eq!(crc16_xmodem_checksum(CHECK), 0x31C3);
        assert_eq!(crc16_ccitt_checksum(CHECK), 0x29B1);
        assert_eq!(crc16_modbus_checksum(CHECK), 0x4B37);
    }

    #[test]
    fn test_crc16_modbus_frame() {
        // Read holding registers request, CRC on the wire is C5 CD
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16_modbus_checksum(&data), 0xCDC5);
        assert_eq!(ChecksumAlgorithm::Crc16Modbus.compute(&data), vec![0xC5, 0xCD]);
    }

    #[test]
    fn test_crc32_test_vector() {
        assert_eq!(crc32_checksum(CHECK), 0xCBF4_3926);
        assert_eq!(
            ChecksumAlgorithm::Crc32.compute(CHECK),
            vec![0xCB, 0xF4, 0x39, 0x26]
        );
        assert_eq!(crc32_checksum(&[]), 0);
    }

    // ========================================================================
    // Fletcher
    // ========================================================================

    #[test]
    fn test_fletcher16_abcde() {
        // Fletcher-16("abcde") = 0xC8F0
        assert_eq!(fletcher16_checksum(b"abcde"), [0xC8, 0xF0]);
    }

    #[test]
    fn test_fletcher32_words_and_padding() {
        // Single word 0x0102: sum1 = sum2 = 0x0102
        assert_eq!(fletcher32_checksum(&[0x01, 0x02]), [0x01, 0x02, 0x01, 0x02]);
        // Odd length pads to 0x0100
        assert_eq!(fletcher32_checksum(&[0x01]), [0x01, 0x00, 0x01, 0x00]);
        assert_eq!(fletcher32_checksum(&[]), [0, 0, 0, 0]);
    }

    // ========================================================================
    // Digests
    // ========================================================================

    #[test]
    fn test_digest_algorithms() {
        assert_eq!(
            hex::encode(ChecksumAlgorithm::Md5.compute(b"")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            hex::encode(ChecksumAlgorithm::Sha1.compute(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hex::encode(ChecksumAlgorithm::Sha256.compute(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    // ========================================================================
    // Algorithm-level behaviour
    // ========================================================================

    #[test]
    fn test_output_bytes_matches_compute() {
        let all = [
            ChecksumAlgorithm::None,
            ChecksumAlgorithm::Xor,
            ChecksumAlgorithm::Sum8,
            ChecksumAlgorithm::Crc8,
            ChecksumAlgorithm::Crc16,
            ChecksumAlgorithm::Crc16Ccitt,
            ChecksumAlgorithm::Crc16Modbus,
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Fletcher16,
            ChecksumAlgorithm::Fletcher32,
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha1,
            ChecksumAlgorithm::Sha256,
        ];
        for algo in all {
            assert_eq!(algo.compute(CHECK).len(), algo.output_bytes(), "{:?}", algo);
        }
    }

    #[test]
    fn test_verify_rejects_wrong_length_and_value() {
        let algo = ChecksumAlgorithm::Crc16;
        let good = algo.compute(b"abc");
        assert!(algo.verify(b"abc", &good));
        assert!(!algo.verify(b"abd", &good));
        assert!(!algo.verify(b"abc", &good[..1]));
    }

    #[test]
    fn test_algorithm_serde_names() {
        let json = serde_json::to_string(&ChecksumAlgorithm::Crc16Modbus).unwrap();
        assert_eq!(json, "\"crc16_modbus\"");
        let parsed: ChecksumAlgorithm = serde_json::from_str("\"fletcher32\"").unwrap();
        assert_eq!(parsed, ChecksumAlgorithm::Fletcher32);
        assert_eq!(ChecksumAlgorithm::default(), ChecksumAlgorithm::None);
    }
}
