//! `std::random::*` and `std::time::*`.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use pat_diagnostics::Location;
use pat_eval::{Error, Evaluator};
use pat_tree::Literal;

use super::register;

fn arg_unsigned(args: &[Literal], i: usize) -> Result<u128, Error> {
    args[i].to_unsigned().map_err(|e| Error::Type(e, Location::empty()))
}

thread_local! {
    /// A per-thread xorshift state, reseeded from wall-clock time on first
    /// use. Good enough for pattern fixtures; not a cryptographic source.
    static RNG_STATE: Cell<u64> = Cell::new(0);
}

fn next_u64() -> u64 {
    RNG_STATE.with(|cell| {
        let mut state = cell.get();
        if state == 0 {
            state = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0x9E37_79B9);
            state |= 1;
        }
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        cell.set(state);
        state
    })
}

pub(super) fn install(eval: &mut Evaluator) {
    register(eval, "std::random::value", 0, 0, vec![], false, |_eval, _args| Ok(Literal::Unsigned(next_u64() as u128)));

    register(eval, "std::random::range", 2, 2, vec![], false, |_eval, args| {
        let low = arg_unsigned(args, 0)?;
        let high = arg_unsigned(args, 1)?;
        if high <= low {
            return Ok(Literal::Unsigned(low));
        }
        let span = (high - low) as u64;
        Ok(Literal::Unsigned(low + (next_u64() % span.max(1)) as u128))
    });

    register(eval, "std::time::unix_timestamp", 0, 0, vec![], false, |_eval, _args| {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        Ok(Literal::Unsigned(secs as u128))
    });
}
