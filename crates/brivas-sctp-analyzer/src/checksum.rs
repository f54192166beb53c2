//! SCTP checksum verification (Adler-32 per RFC 2960, CRC32c per RFC 9260)
//!
//! The checksum field of the common header is treated as zero during
//! computation. CRC32c is carried little-endian on the wire, Adler-32 in
//! network byte order.

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use tracing::debug;

static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const CHECKSUM_OFFSET: usize = 8;
const CHECKSUM_LEN: usize = 4;
const FOUR_ZEROES: [u8; 4] = [0; 4];

/// Which checksum algorithm to verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMethod {
    /// Do not verify
    #[default]
    None,
    Adler32,
    Crc32c,
    /// Accept whichever of CRC32c or Adler-32 matches
    Automatic,
}

/// Verification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChecksumStatus {
    Verified,
    Mismatched,
    /// Not verified (disabled or incomplete capture)
    Unknown,
}

/// Checksum facts for one datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumResult {
    /// Algorithm the status refers to
    pub method: ChecksumMethod,
    /// Value found in the common header (network order)
    pub declared: u32,
    /// Value computed over the datagram, in the same byte order as `declared`
    pub calculated: Option<u32>,
    pub status: ChecksumStatus,
}

/// Stateless checksum verifier
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// CRC32c over the datagram with the checksum field zeroed
    pub fn crc32c(datagram: &[u8]) -> u32 {
        let mut digest = CASTAGNOLI.digest();
        Self::feed(datagram, |part| digest.update(part));
        digest.finalize()
    }

    /// Adler-32 over the datagram with the checksum field zeroed
    pub fn adler32(datagram: &[u8]) -> u32 {
        let mut adler = adler::Adler32::new();
        Self::feed(datagram, |part| adler.write_slice(part));
        adler.checksum()
    }

    /// Verify `datagram` against its declared checksum.
    ///
    /// `reported_len` is the on-wire length; a shorter capture cannot be
    /// verified and yields `Unknown`.
    pub fn verify(datagram: &[u8], reported_len: usize, method: ChecksumMethod) -> ChecksumResult {
        let declared = declared_checksum(datagram);

        if method == ChecksumMethod::None
            || datagram.len() < CHECKSUM_OFFSET + CHECKSUM_LEN
            || datagram.len() < reported_len
        {
            return unverified(method, declared);
        }

        match method {
            ChecksumMethod::Adler32 => Self::check_adler32(datagram, declared),
            ChecksumMethod::Crc32c => Self::check_crc32c(datagram, declared),
            ChecksumMethod::Automatic => {
                let crc = Self::check_crc32c(datagram, declared);
                if crc.status == ChecksumStatus::Verified {
                    return crc;
                }
                let adler = Self::check_adler32(datagram, declared);
                if adler.status == ChecksumStatus::Verified {
                    return adler;
                }
                debug!(declared, "Checksum matches neither CRC32c nor Adler-32");
                crc
            }
            ChecksumMethod::None => unverified(method, declared),
        }
    }

    fn check_crc32c(datagram: &[u8], declared: u32) -> ChecksumResult {
        // Present the CRC in the same order the header field is read in.
        let calculated = u32::from_be_bytes(Self::crc32c(datagram).to_le_bytes());
        ChecksumResult {
            method: ChecksumMethod::Crc32c,
            declared,
            calculated: Some(calculated),
            status: status(declared, calculated),
        }
    }

    fn check_adler32(datagram: &[u8], declared: u32) -> ChecksumResult {
        let calculated = Self::adler32(datagram);
        ChecksumResult {
            method: ChecksumMethod::Adler32,
            declared,
            calculated: Some(calculated),
            status: status(declared, calculated),
        }
    }

    fn feed(datagram: &[u8], mut update: impl FnMut(&[u8])) {
        if datagram.len() < CHECKSUM_OFFSET + CHECKSUM_LEN {
            update(datagram);
            return;
        }
        update(&datagram[..CHECKSUM_OFFSET]);
        update(&FOUR_ZEROES);
        update(&datagram[CHECKSUM_OFFSET + CHECKSUM_LEN..]);
    }
}

fn declared_checksum(datagram: &[u8]) -> u32 {
    datagram
        .get(CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

fn unverified(method: ChecksumMethod, declared: u32) -> ChecksumResult {
    ChecksumResult {
        method,
        declared,
        calculated: None,
        status: ChecksumStatus::Unknown,
    }
}

fn status(declared: u32, calculated: u32) -> ChecksumStatus {
    if declared == calculated {
        ChecksumStatus::Verified
    } else {
        ChecksumStatus::Mismatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram() -> Vec<u8> {
        let mut d = vec![
            0x0b, 0x59, 0x0b, 0x59, // ports 2905 -> 2905
            0x12, 0x34, 0x56, 0x78, // vtag
            0x00, 0x00, 0x00, 0x00, // checksum
        ];
        // SHUTDOWN-ACK chunk
        d.extend_from_slice(&[0x08, 0x00, 0x00, 0x04]);
        d
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(CASTAGNOLI.checksum(b"123456789"), 0xE306_9283);
        let mut adler = adler::Adler32::new();
        adler.write_slice(b"Wikipedia");
        assert_eq!(adler.checksum(), 0x11E6_0398);
    }

    #[test]
    fn test_crc32c_verified_and_mismatched() {
        let mut d = datagram();
        let crc = ChecksumVerifier::crc32c(&d);
        d[8..12].copy_from_slice(&crc.to_le_bytes());

        let result = ChecksumVerifier::verify(&d, d.len(), ChecksumMethod::Crc32c);
        assert_eq!(result.status, ChecksumStatus::Verified);
        assert_eq!(result.calculated, Some(result.declared));

        d[11] ^= 0xFF;
        let result = ChecksumVerifier::verify(&d, d.len(), ChecksumMethod::Crc32c);
        assert_eq!(result.status, ChecksumStatus::Mismatched);
    }

    #[test]
    fn test_adler32_verified_and_mismatched() {
        let mut d = datagram();
        let adler = ChecksumVerifier::adler32(&d);
        d[8..12].copy_from_slice(&adler.to_be_bytes());

        let result = ChecksumVerifier::verify(&d, d.len(), ChecksumMethod::Adler32);
        assert_eq!(result.status, ChecksumStatus::Verified);

        d[8..12].copy_from_slice(&adler.wrapping_add(1).to_be_bytes());
        let result = ChecksumVerifier::verify(&d, d.len(), ChecksumMethod::Adler32);
        assert_eq!(result.status, ChecksumStatus::Mismatched);
    }

    #[test]
    fn test_automatic_picks_matching_method() {
        let mut d = datagram();
        let adler = ChecksumVerifier::adler32(&d);
        d[8..12].copy_from_slice(&adler.to_be_bytes());

        let result = ChecksumVerifier::verify(&d, d.len(), ChecksumMethod::Automatic);
        assert_eq!(result.status, ChecksumStatus::Verified);
        assert_eq!(result.method, ChecksumMethod::Adler32);
    }

    #[test]
    fn test_incomplete_capture_is_unknown() {
        let d = datagram();
        let result = ChecksumVerifier::verify(&d, d.len() + 100, ChecksumMethod::Crc32c);
        assert_eq!(result.status, ChecksumStatus::Unknown);
        assert!(result.calculated.is_none());
    }
}
