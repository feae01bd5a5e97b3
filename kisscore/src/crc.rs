//! SMACK CRC-16 and Kantronics/BPQ-style XOR checksum.

/// CRC-16 used by SMACK frames: poly 0x8005, init 0x0000, non-reflected, no final XOR.
///
/// This is the algorithm commonly catalogued as CRC-16/BUYPASS; `check` is its
/// standard test value for the ASCII string "123456789".
pub const SMACK_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0x0000,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0xFEE8,
    residue: 0x0000,
};

/// Compute the SMACK CRC-16 over `input` (the type byte followed by the frame body).
pub fn smack_crc(input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(&SMACK_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

/// Fold `input` with XOR to produce the Kantronics/BPQ-style checksum byte.
pub fn xor_checksum(input: &[u8]) -> u8 {
    input.iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_test_vectors() {
        assert_eq!(smack_crc(&[]), 0x0000);
        assert_eq!(smack_crc("123456789".as_bytes()), 0xFEE8);
    }

    #[test]
    fn crc_over_smack_data_frame_header() {
        // Type byte 0xA0 (SMACK bit + address 2 + DATA) followed by payload "A".
        assert_eq!(smack_crc(&[0xA0, 0x41]), 0xC18C);
    }

    #[test]
    fn xor_checksum_folds_bytes() {
        assert_eq!(xor_checksum(&[0x30, 0x01, 0x02, 0x03]), 0x30);
        assert_eq!(xor_checksum(&[]), 0x00);
        assert_eq!(xor_checksum(&[0xFF]), 0xFF);
    }
}
