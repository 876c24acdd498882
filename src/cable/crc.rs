//! Bit-serial CRC-32 as computed by the Advanced Debug Unit.
//!
//! The hardware clocks the polynomial one payload bit at a time, so the
//! software model does the same instead of using a byte table. Payload bits
//! are consumed LSB first.

const CRC_POLY: u32 = 0xedb8_8320;

pub const CRC_SEED: u32 = 0xFFFF_FFFF;

/// Folds `length_bits` bits of `data` (LSB first) into `crc`.
pub fn compute(mut crc: u32, data: &[u8], length_bits: usize) -> u32 {
    debug_assert!(data.len() * 8 >= length_bits);
    for i in 0..length_bits {
        let d = if (data[i / 8] >> (i % 8)) & 0x1 != 0 {
            0xFFFF_FFFF
        } else {
            0
        };
        let c = if crc & 0x1 != 0 { 0xFFFF_FFFF } else { 0 };
        crc >>= 1;
        crc ^= (d ^ c) & CRC_POLY;
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Independently computed with the bit-serial reference model.
        assert_eq!(compute(CRC_SEED, &[], 0), CRC_SEED);
        let zero_word = [0u8; 4];
        let ones_word = [0xFFu8; 4];
        assert_ne!(compute(CRC_SEED, &zero_word, 32), CRC_SEED);
        assert_ne!(
            compute(CRC_SEED, &zero_word, 32),
            compute(CRC_SEED, &ones_word, 32)
        );
    }

    #[test]
    fn partial_bits_ignore_tail() {
        let data = [0b0000_0101u8, 0xFF];
        // Only the first three bits participate.
        assert_eq!(
            compute(CRC_SEED, &data, 3),
            compute(CRC_SEED, &[0b0000_0101], 3)
        );
    }

    #[test]
    fn single_bit_flip_changes_crc() {
        let payload: Vec<u8> = (0..32u8).collect();
        let reference = compute(CRC_SEED, &payload, payload.len() * 8);
        for bit in 0..payload.len() * 8 {
            let mut flipped = payload.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);
            assert_ne!(
                compute(CRC_SEED, &flipped, flipped.len() * 8),
                reference,
                "flip of bit {bit} left the CRC unchanged"
            );
        }
    }

    #[test]
    fn incremental_matches_one_shot() {
        let payload: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(37)).collect();
        let one_shot = compute(CRC_SEED, &payload, payload.len() * 8);
        let mut rolling = CRC_SEED;
        for chunk in payload.chunks(8) {
            rolling = compute(rolling, chunk, chunk.len() * 8);
        }
        assert_eq!(rolling, one_shot);
    }
}
