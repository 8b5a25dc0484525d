//! File checksum accumulation and end-of-file verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::block::BlockChecksum;
use crate::error::{RarError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Hashes delivered plaintext and validates the expected checksum at end
/// of file.
///
/// Encrypted v5 archives store `HMAC-SHA-256(hash_key, sum)` instead of
/// the raw sum; when the expected value is CRC32-sized the 32-byte MAC is
/// folded down to four bytes by XOR.
pub(crate) struct FileChecksum {
    hasher: crc32fast::Hasher,
    key: Option<Vec<u8>>,
    expected: Vec<u8>,
    verified: bool,
}

impl FileChecksum {
    pub(crate) fn new(check: &BlockChecksum) -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
            key: check.key.clone(),
            expected: check.sum.clone(),
            verified: false,
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Compares the accumulated sum against the expectation. Called once
    /// when the plaintext stream reaches EOF; later calls are no-ops.
    pub(crate) fn verify(&mut self) -> Result<()> {
        if self.verified {
            return Ok(());
        }
        self.verified = true;

        let mut sum = self.hasher.clone().finalize().to_le_bytes().to_vec();
        if let Some(key) = &self.key {
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|_| RarError::BadFileChecksum)?;
            mac.update(&sum);
            let mut digest = mac.finalize().into_bytes().to_vec();
            if self.expected.len() == 4 {
                // fold the MAC down to a CRC32-sized tag
                for i in 4..digest.len() {
                    digest[i & 3] ^= digest[i];
                }
                digest.truncate(4);
            }
            sum = digest;
        }
        if sum.len() != self.expected.len() || sum.ct_eq(&self.expected).unwrap_u8() != 1 {
            return Err(RarError::BadFileChecksum);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum_of(data: &[u8], expected: Vec<u8>, key: Option<Vec<u8>>) -> Result<()> {
        let mut fc = FileChecksum::new(&BlockChecksum { key, sum: expected });
        fc.update(data);
        fc.verify()
    }

    #[test]
    fn test_crc32_match() {
        // "Hello, World!\n" has CRC32 0x8dcbd8c7
        let sum = 0x8dcb_d8c7u32.to_le_bytes().to_vec();
        assert!(checksum_of(b"Hello, World!\n", sum, None).is_ok());
    }

    #[test]
    fn test_crc32_mismatch() {
        let sum = 0xdead_beefu32.to_le_bytes().to_vec();
        assert!(matches!(
            checksum_of(b"Hello, World!\n", sum, None),
            Err(RarError::BadFileChecksum)
        ));
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let data = b"some longer buffer of test data";
        let sum = crc32fast::hash(data).to_le_bytes().to_vec();
        let mut fc = FileChecksum::new(&BlockChecksum {
            key: None,
            sum,
        });
        for chunk in data.chunks(7) {
            fc.update(chunk);
        }
        assert!(fc.verify().is_ok());
        // verification is idempotent once passed
        assert!(fc.verify().is_ok());
    }

    #[test]
    fn test_hmac_folded_tag() {
        let data = b"payload";
        let key = vec![9u8; 32];
        let crc = crc32fast::hash(data).to_le_bytes();

        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(&crc);
        let mut digest = mac.finalize().into_bytes().to_vec();
        for i in 4..digest.len() {
            digest[i & 3] ^= digest[i];
        }
        digest.truncate(4);

        assert!(checksum_of(data, digest.clone(), Some(key.clone())).is_ok());
        // without the key the raw crc no longer matches the folded tag
        assert!(checksum_of(data, digest, None).is_err());
    }
}
