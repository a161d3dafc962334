//! `std::hash::*`. A small self-contained CRC-32 (IEEE 802.3 polynomial)
//! rather than pulling in a dedicated crate for a single checksum.

use pat_eval::Evaluator;
use pat_tree::Literal;

use super::register;

fn crc32(bytes: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
    }
    !crc
}

pub(super) fn install(eval: &mut Evaluator) {
    register(eval, "std::hash::crc32", 1, 1, vec![], false, |_eval, args| {
        let text = args[0].to_display_string();
        Ok(Literal::Unsigned(crc32(text.as_bytes()) as u128))
    });
}
