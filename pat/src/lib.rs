pub use pat_diagnostics as diagnostics;
pub use pat_eval as eval;
pub use pat_lexer as lexer;
pub use pat_parser as parser;
pub use pat_preprocess as preprocess;
pub use pat_rt as rt;
pub use pat_sections as sections;
pub use pat_source as source;
pub use pat_tree as tree;
pub use pat_validate as validate;

pub use pat_rt::{Runtime, RuntimeConfig, RuntimeError};
