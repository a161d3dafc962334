//! `std::string::*` and `std::{print,warning,error,format}`.

use pat_diagnostics::Location;
use pat_eval::{Error, Evaluator};
use pat_tree::Literal;

use super::register;

fn arg_string(args: &[Literal], i: usize) -> String {
    args[i].to_display_string()
}

fn arg_unsigned(args: &[Literal], i: usize) -> Result<u128, Error> {
    args[i].to_unsigned().map_err(|e| Error::Type(e, Location::empty()))
}

/// Replaces each `{}` in `fmt` with the display form of the corresponding
/// extra argument, left to right; surplus placeholders are left untouched.
fn format(fmt: &str, args: &[Literal]) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut it = args.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'}') {
            chars.next();
            match it.next() {
                Some(v) => out.push_str(&v.to_display_string()),
                None => out.push_str("{}"),
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub(super) fn install(eval: &mut Evaluator) {
    register(eval, "std::string::length", 1, 1, vec![], false, |_eval, args| {
        Ok(Literal::Unsigned(arg_string(args, 0).chars().count() as u128))
    });

    register(eval, "std::string::at", 2, 2, vec![], false, |_eval, args| {
        let s = arg_string(args, 0);
        let index = arg_unsigned(args, 1)? as usize;
        s.chars().nth(index).map(Literal::Char).ok_or_else(|| Error::IndexOutOfRange {
            index: index as i128,
            length: s.chars().count() as u64,
            location: Location::empty(),
        })
    });

    register(eval, "std::string::substr", 3, 3, vec![], false, |_eval, args| {
        let s = arg_string(args, 0);
        let start = arg_unsigned(args, 1)? as usize;
        let len = arg_unsigned(args, 2)? as usize;
        let sub: String = s.chars().skip(start).take(len).collect();
        Ok(Literal::Str(sub))
    });

    register(eval, "std::string::to_upper", 1, 1, vec![], false, |_eval, args| {
        Ok(Literal::Str(arg_string(args, 0).to_uppercase()))
    });

    register(eval, "std::string::to_lower", 1, 1, vec![], false, |_eval, args| {
        Ok(Literal::Str(arg_string(args, 0).to_lowercase()))
    });

    register(eval, "std::format", 1, 8, vec![Literal::Str(String::new()); 7], false, |_eval, args| {
        let fmt = arg_string(args, 0);
        Ok(Literal::Str(format(&fmt, &args[1..])))
    });

    register(eval, "std::print", 1, 8, vec![Literal::Str(String::new()); 7], false, |eval, args| {
        let fmt = arg_string(args, 0);
        eval.log(log::Level::Info, format(&fmt, &args[1..]));
        Ok(Literal::Unsigned(0))
    });

    register(eval, "std::warning", 1, 8, vec![Literal::Str(String::new()); 7], false, |eval, args| {
        let fmt = arg_string(args, 0);
        eval.log(log::Level::Warn, format(&fmt, &args[1..]));
        Ok(Literal::Unsigned(0))
    });

    register(eval, "std::error", 1, 8, vec![Literal::Str(String::new()); 7], false, |eval, args| {
        let fmt = arg_string(args, 0);
        let message = format(&fmt, &args[1..]);
        eval.log(log::Level::Error, message.clone());
        Err(Error::Builtin { name: "std::error".into(), message, location: Location::empty() })
    });
}
