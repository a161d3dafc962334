//! `std::math::*`.

use pat_diagnostics::Location;
use pat_eval::{Error, Evaluator};
use pat_tree::Literal;

use super::register;

fn arg_float(args: &[Literal], i: usize) -> Result<f64, Error> {
    args[i].to_float().map_err(|e| Error::Type(e, Location::empty()))
}

/// `min`/`max`/`abs` stay integral when both inputs are, matching the
/// pattern language's habit of keeping widths stable through arithmetic.
fn both_signed(a: &Literal, b: &Literal) -> Option<(i128, i128)> {
    match (a, b) {
        (Literal::Unsigned(_) | Literal::Signed(_), Literal::Unsigned(_) | Literal::Signed(_)) => {
            Some((a.to_signed().ok()?, b.to_signed().ok()?))
        }
        _ => None,
    }
}

pub(super) fn install(eval: &mut Evaluator) {
    register(eval, "std::math::min", 2, 2, vec![], false, |_eval, args| {
        if let Some((a, b)) = both_signed(&args[0], &args[1]) {
            return Ok(if a <= b { args[0].clone() } else { args[1].clone() });
        }
        let (a, b) = (arg_float(args, 0)?, arg_float(args, 1)?);
        Ok(Literal::Float(a.min(b)))
    });

    register(eval, "std::math::max", 2, 2, vec![], false, |_eval, args| {
        if let Some((a, b)) = both_signed(&args[0], &args[1]) {
            return Ok(if a >= b { args[0].clone() } else { args[1].clone() });
        }
        let (a, b) = (arg_float(args, 0)?, arg_float(args, 1)?);
        Ok(Literal::Float(a.max(b)))
    });

    register(eval, "std::math::abs", 1, 1, vec![], false, |_eval, args| match &args[0] {
        Literal::Signed(v) => Ok(Literal::Signed(v.abs())),
        Literal::Unsigned(v) => Ok(Literal::Unsigned(*v)),
        _ => Ok(Literal::Float(arg_float(args, 0)?.abs())),
    });

    register(eval, "std::math::pow", 2, 2, vec![], false, |_eval, args| {
        Ok(Literal::Float(arg_float(args, 0)?.powf(arg_float(args, 1)?)))
    });

    register(eval, "std::math::sqrt", 1, 1, vec![], false, |_eval, args| Ok(Literal::Float(arg_float(args, 0)?.sqrt())));

    register(eval, "std::math::floor", 1, 1, vec![], false, |_eval, args| Ok(Literal::Float(arg_float(args, 0)?.floor())));

    register(eval, "std::math::ceil", 1, 1, vec![], false, |_eval, args| Ok(Literal::Float(arg_float(args, 0)?.ceil())));

    register(eval, "std::math::round", 1, 1, vec![], false, |_eval, args| Ok(Literal::Float(arg_float(args, 0)?.round())));
}
