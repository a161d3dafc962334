//! `std::mem::*`: raw reads/writes against the main input and the
//! pattern-local scratch section.

use pat_diagnostics::Location;
use pat_eval::{Error, Evaluator};
use pat_tree::Literal;
use pat_tree::{MAIN_SECTION_ID, PATTERN_LOCAL_SECTION_ID};

use super::register;

fn arg_unsigned(args: &[Literal], i: usize) -> Result<u128, Error> {
    args[i].to_unsigned().map_err(|e| Error::Type(e, Location::empty()))
}

fn le_bytes_to_unsigned(bytes: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    u128::from_le_bytes(buf)
}

fn le_bytes_to_signed(bytes: &[u8]) -> i128 {
    let value = le_bytes_to_unsigned(bytes);
    let bits = bytes.len() * 8;
    if bits == 0 || bits >= 128 {
        return value as i128;
    }
    let sign_bit = 1u128 << (bits - 1);
    if value & sign_bit != 0 {
        (value as i128) - (1i128 << bits)
    } else {
        value as i128
    }
}

pub(super) fn install(eval: &mut Evaluator) {
    register(eval, "std::mem::read_unsigned", 2, 2, vec![], false, |eval, args| {
        let address = arg_unsigned(args, 0)? as u64;
        let size = arg_unsigned(args, 1)? as usize;
        let bytes = eval.read_memory(MAIN_SECTION_ID, address, size)?;
        Ok(Literal::Unsigned(le_bytes_to_unsigned(&bytes)))
    });

    register(eval, "std::mem::read_signed", 2, 2, vec![], false, |eval, args| {
        let address = arg_unsigned(args, 0)? as u64;
        let size = arg_unsigned(args, 1)? as usize;
        let bytes = eval.read_memory(MAIN_SECTION_ID, address, size)?;
        Ok(Literal::Signed(le_bytes_to_signed(&bytes)))
    });

    register(eval, "std::mem::read_string", 2, 2, vec![], false, |eval, args| {
        let address = arg_unsigned(args, 0)? as u64;
        let size = arg_unsigned(args, 1)? as usize;
        let bytes = eval.read_memory(MAIN_SECTION_ID, address, size)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(Literal::Str(String::from_utf8_lossy(&bytes[..end]).into_owned()))
    });

    // Scratch writes land in the pattern-local section: the main input is
    // always read-only.
    register(eval, "std::mem::write_unsigned", 3, 3, vec![], false, |eval, args| {
        let address = arg_unsigned(args, 0)? as u64;
        let size = arg_unsigned(args, 1)? as usize;
        let value = arg_unsigned(args, 2)?;
        let bytes = value.to_le_bytes();
        eval.write_memory(PATTERN_LOCAL_SECTION_ID, address, &bytes[..size.min(16)])?;
        Ok(Literal::Unsigned(value))
    });

    register(eval, "std::mem::base_address", 0, 0, vec![], false, |_eval, _args| Ok(Literal::Unsigned(0)));

    register(eval, "std::mem::size", 0, 0, vec![], false, |eval, _args| {
        Ok(Literal::Unsigned(eval.memory_size(MAIN_SECTION_ID) as u128))
    });
}
