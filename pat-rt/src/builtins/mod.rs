//! The default `std::*` builtin function table registered into every fresh
//! [`Evaluator`] by the runtime facade.

mod file;
mod hash;
mod math;
mod memory;
mod string;
mod system;

use std::sync::Arc;

use pat_eval::{Error, Evaluator, FunctionBody, FunctionRecord};
use pat_tree::Literal;

pub(crate) type BuiltinFn = Arc<dyn Fn(&mut Evaluator, &[Literal]) -> Result<Literal, Error> + Send + Sync>;

/// Registers a builtin under `name` taking between `min` and `max`
/// arguments (missing trailing ones fill from `defaults`, left to right).
pub(crate) fn register(
    eval: &mut Evaluator,
    name: &str,
    min: usize,
    max: usize,
    defaults: Vec<Literal>,
    dangerous: bool,
    f: impl Fn(&mut Evaluator, &[Literal]) -> Result<Literal, Error> + Send + Sync + 'static,
) {
    eval.register_function(
        name,
        FunctionRecord { min_params: min, max_params: max, defaults, dangerous, body: FunctionBody::Builtin(Arc::new(f)) },
    );
}

pub fn install_defaults(eval: &mut Evaluator) {
    memory::install(eval);
    string::install(eval);
    math::install(eval);
    hash::install(eval);
    system::install(eval);
    file::install(eval);
}
