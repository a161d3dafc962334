//! `std::file::*`: every function here goes through the dangerous-call
//! handler before it touches disk.

use pat_diagnostics::Location;
use pat_eval::{Error, Evaluator};
use pat_tree::Literal;

use super::register;

pub(super) fn install(eval: &mut Evaluator) {
    register(eval, "std::file::read", 1, 1, vec![], true, |_eval, args| {
        let path = args[0].to_display_string();
        std::fs::read_to_string(&path)
            .map(Literal::Str)
            .map_err(|e| Error::Builtin { name: "std::file::read".into(), message: e.to_string(), location: Location::empty() })
    });

    register(eval, "std::file::write", 2, 2, vec![], true, |_eval, args| {
        let path = args[0].to_display_string();
        let content = args[1].to_display_string();
        std::fs::write(&path, content).map_err(|e| Error::Builtin {
            name: "std::file::write".into(),
            message: e.to_string(),
            location: Location::empty(),
        })?;
        Ok(Literal::Boolean(true))
    });
}
