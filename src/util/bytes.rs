//! Byte level helpers for reinterpreting resource data.

use crate::error::Error;

/// Reinterprets raw resource bytes as a SPIR-V word stream.
///
/// SPIR-V is defined as a stream of 32 bit words so the input length must be
/// divisible by 4. The words are assembled little endian which matches the
/// on disk format produced by all common compilers.
pub fn bytes_to_spirv(data: &[u8]) -> Result<Vec<u32>, Error> {
    if data.len() % 4 != 0 {
        log::error!("spirv byte stream length {} is not a multiple of 4", data.len());
        return Err(Error::InternalError);
    }

    Ok(data.chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned() {
        assert_eq!(bytes_to_spirv(&[0u8; 7]).unwrap_err(), Error::InternalError);
        assert_eq!(bytes_to_spirv(&[0u8; 1]).unwrap_err(), Error::InternalError);
    }

    #[test]
    fn little_endian_words() {
        let words = bytes_to_spirv(&[0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0]).unwrap();
        // First word of any SPIR-V module is the magic number.
        assert_eq!(words, vec![0x07230203, 0x00010000]);
    }

    #[test]
    fn empty_is_valid() {
        assert!(bytes_to_spirv(&[]).unwrap().is_empty());
    }
}
