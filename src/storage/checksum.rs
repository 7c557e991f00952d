// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use super::{ChecksumType, StorageResult, TracedStorageError};

pub fn build_checksum(checksum_type: ChecksumType, data: &[u8]) -> u64 {
    match checksum_type {
        ChecksumType::None => 0,
        ChecksumType::Crc32 => crc32fast::hash(data) as u64,
    }
}

pub fn verify_checksum(checksum_type: ChecksumType, data: &[u8], checksum: u64) -> StorageResult<()> {
    match checksum_type {
        ChecksumType::None => Ok(()),
        ChecksumType::Crc32 => {
            let found = crc32fast::hash(data) as u64;
            if found != checksum {
                return Err(TracedStorageError::checksum(found, checksum));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify() {
        let data = b"segment";
        let cksum = build_checksum(ChecksumType::Crc32, data);
        verify_checksum(ChecksumType::Crc32, data, cksum).unwrap();
        assert!(verify_checksum(ChecksumType::Crc32, b"segmenT", cksum).is_err());
        verify_checksum(ChecksumType::None, b"anything", 0).unwrap();
    }
}
