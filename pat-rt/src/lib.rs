//! Orchestrates preprocessor → lexer → parser → validator → evaluator and
//! registers the default `std::*` pragmas and builtin functions. This is
//! the one crate an embedder talks to.

pub mod error;

mod builtins;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use pat_diagnostics::Location;
use pat_eval::{Error as EvalError, Evaluator, FunctionBody, FunctionRecord, Limits};
use pat_parser::Node;
use pat_preprocess::Preprocessor;
use pat_sections::InMemorySection;
use pat_source::{FileResolver, Resolver};
use pat_tree::{Endian, Literal, Pattern};

pub use error::RuntimeError;

/// Config a `#pragma` directive can change, applied before the evaluator
/// for a run is built.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub recursion_limit: u32,
    pub limits: Limits,
    pub default_endian: Endian,
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recursion_limit: pat_validate::DEFAULT_RECURSION_LIMIT,
            limits: Limits::default(),
            default_endian: Endian::Little,
            debug: false,
        }
    }
}

type PragmaHandler = Box<dyn Fn(&mut RuntimeConfig, &str) -> bool + Send + Sync>;

fn default_pragma_handlers() -> AHashMap<String, PragmaHandler> {
    let mut handlers: AHashMap<String, PragmaHandler> = AHashMap::new();

    // The preprocessor already performs the include-guard dedup; the
    // runtime only needs to acknowledge the directive.
    handlers.insert("once".into(), Box::new(|_cfg, _value| true));

    handlers.insert(
        "endian".into(),
        Box::new(|cfg, value| {
            cfg.default_endian = match value.trim() {
                "big" => Endian::Big,
                "little" => Endian::Little,
                "native" => Endian::Native,
                _ => return false,
            };
            true
        }),
    );

    handlers.insert(
        "eval_depth".into(),
        Box::new(|cfg, value| match value.trim().parse::<u32>() {
            Ok(n) => {
                cfg.recursion_limit = n;
                cfg.limits.evaluation_depth = n;
                true
            }
            Err(_) => false,
        }),
    );

    handlers.insert(
        "array_limit".into(),
        Box::new(|cfg, value| match value.trim().parse::<u32>() {
            Ok(n) => {
                cfg.limits.array_limit = n;
                true
            }
            Err(_) => false,
        }),
    );

    handlers.insert(
        "pattern_limit".into(),
        Box::new(|cfg, value| match value.trim().parse::<u32>() {
            Ok(n) => {
                cfg.limits.pattern_limit = n;
                true
            }
            Err(_) => false,
        }),
    );

    handlers.insert(
        "loop_limit".into(),
        Box::new(|cfg, value| match value.trim().parse::<u32>() {
            Ok(n) => {
                cfg.limits.loop_limit = n;
                true
            }
            Err(_) => false,
        }),
    );

    handlers.insert(
        "debug".into(),
        Box::new(|cfg, _value| {
            cfg.debug = true;
            true
        }),
    );

    handlers
}

struct ExtraFunction {
    min: usize,
    max: usize,
    dangerous: bool,
    callback: builtins::BuiltinFn,
}

/// The runtime facade: owns the shared resolver and configuration across
/// runs, and rebuilds a fresh [`Evaluator`] for each `execute_*` call.
pub struct Runtime {
    resolver: Resolver,
    config: RuntimeConfig,
    pragma_handlers: AHashMap<String, PragmaHandler>,
    extra_functions: AHashMap<String, ExtraFunction>,
    dangerous_handler: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    defines: Vec<(String, String)>,
    data: Vec<u8>,
    aborted: Arc<AtomicBool>,
    running: bool,
    ast: Vec<Node>,
    types: AHashMap<String, Node>,
    patterns: Vec<Pattern>,
    console_log: Vec<(log::Level, String)>,
    out_vars: AHashMap<String, Literal>,
    error: Option<RuntimeError>,
    created_pattern_count: u32,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        let mut resolver = Resolver::new();
        resolver.set_default(Box::new(FileResolver::new(Vec::new())));
        Self {
            resolver,
            config: RuntimeConfig::default(),
            pragma_handlers: default_pragma_handlers(),
            extra_functions: AHashMap::new(),
            dangerous_handler: None,
            defines: Vec::new(),
            data: Vec::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            running: false,
            ast: Vec::new(),
            types: AHashMap::new(),
            patterns: Vec::new(),
            console_log: Vec::new(),
            out_vars: AHashMap::new(),
            error: None,
            created_pattern_count: 0,
        }
    }

    // --- embedding API -------------------------------------------------------

    pub fn set_data_source(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn set_include_paths(&mut self, paths: Vec<std::path::PathBuf>) {
        self.resolver.set_default(Box::new(FileResolver::new(paths)));
    }

    pub fn add_define(&mut self, name: &str, value: &str) {
        // Stored and replayed into a fresh `Preprocessor` per run, since
        // `Preprocessor` borrows the resolver for its own lifetime.
        self.defines.push((name.to_string(), value.to_string()));
    }

    pub fn add_pragma(&mut self, name: impl Into<String>, handler: impl Fn(&mut RuntimeConfig, &str) -> bool + Send + Sync + 'static) {
        self.pragma_handlers.insert(name.into(), Box::new(handler));
    }

    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        min_params: usize,
        max_params: usize,
        callback: impl Fn(&mut Evaluator, &[Literal]) -> Result<Literal, EvalError> + Send + Sync + 'static,
    ) {
        self.extra_functions.insert(
            name.into(),
            ExtraFunction { min: min_params, max: max_params, dangerous: false, callback: Arc::new(callback) },
        );
    }

    pub fn add_dangerous_function(
        &mut self,
        name: impl Into<String>,
        min_params: usize,
        max_params: usize,
        callback: impl Fn(&mut Evaluator, &[Literal]) -> Result<Literal, EvalError> + Send + Sync + 'static,
    ) {
        self.extra_functions.insert(
            name.into(),
            ExtraFunction { min: min_params, max: max_params, dangerous: true, callback: Arc::new(callback) },
        );
    }

    pub fn set_dangerous_function_handler(&mut self, handler: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.dangerous_handler = Some(Arc::new(handler));
    }

    // --- façade surface --------------------------------------------------------

    pub fn parse(&mut self, name: &str, code: &str) -> bool {
        self.running = true;
        let source = self.resolver.add_virtual(code, name);
        let result = self.compile(source);
        self.running = false;
        self.finish(result.map(|_| ()))
    }

    pub fn execute_string(&mut self, code: &str, env: AHashMap<String, Literal>, in_vars: AHashMap<String, Literal>) -> bool {
        self.running = true;
        let source = self.resolver.add_virtual(code, "<string>");
        let result = self.compile(source).and_then(|output| self.evaluate(output, env, in_vars));
        self.running = false;
        self.finish(result)
    }

    pub fn execute_file(&mut self, path: &Path, env: AHashMap<String, Literal>, in_vars: AHashMap<String, Literal>) -> bool {
        self.running = true;
        let result = std::fs::read_to_string(path)
            .map_err(|e| {
                RuntimeError(
                    pat_preprocess::Error::IncludeNotFound {
                        path: path.display().to_string(),
                        location: Location::empty(),
                        reason: e.to_string(),
                    }
                    .into_diagnostic(),
                )
            })
            .and_then(|code| {
                let source = self.resolver.add_virtual(code, path.display().to_string());
                self.compile(source)
            })
            .and_then(|output| self.evaluate(output, env, in_vars));
        self.running = false;
        self.finish(result)
    }

    /// Wraps `code` as an anonymous zero-argument function body, compiles
    /// it standalone, and calls it immediately.
    pub fn execute_function(&mut self, code: &str) -> (bool, Option<Literal>) {
        self.running = true;
        let wrapped = format!("fn __pat_rt_anon__() {{ {code} }}");
        let result = (|| {
            let source = self.resolver.add_virtual(wrapped, "<function>");
            let output = self.compile(source)?;
            let mut eval = self.build_evaluator(output.types.clone(), AHashMap::new(), AHashMap::new());
            let value = eval
                .run_function(&output.statements, "__pat_rt_anon__", Vec::new())
                .map_err(|e| RuntimeError(e.into_diagnostic()))?;
            self.collect_from(&eval);
            Ok(value)
        })();
        self.running = false;
        match result {
            Ok(value) => {
                self.error = None;
                (true, Some(value))
            }
            Err(err) => {
                self.error = Some(err);
                self.patterns.clear();
                (false, None)
            }
        }
    }

    pub fn reset(&mut self) {
        self.ast.clear();
        self.types.clear();
        self.patterns.clear();
        self.console_log.clear();
        self.out_vars.clear();
        self.error = None;
        self.created_pattern_count = 0;
        self.aborted.store(false, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn console_log(&self) -> &[(log::Level, String)] {
        &self.console_log
    }

    pub fn error(&self) -> Option<&RuntimeError> {
        self.error.as_ref()
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn out_variables(&self) -> &AHashMap<String, Literal> {
        &self.out_vars
    }

    pub fn current_ast(&self) -> &[Node] {
        &self.ast
    }

    pub fn created_pattern_count(&self) -> u32 {
        self.created_pattern_count
    }

    pub fn maximum_pattern_count(&self) -> u32 {
        self.config.limits.pattern_limit
    }

    // --- pipeline ------------------------------------------------------------

    fn compile(&mut self, source: Arc<pat_source::Source>) -> Result<pat_parser::ParseOutput, RuntimeError> {
        let mut preprocessor = Preprocessor::new(&mut self.resolver);
        for (name, value) in &self.defines {
            preprocessor.add_define(name, value);
        }
        let preprocessed = preprocessor.run(source).map_err(|mut diags| RuntimeError(diags.remove(0)))?;

        let mut config = self.config.clone();
        for pragma in &preprocessed.pragmas {
            let handled = match self.pragma_handlers.get(pragma.key.as_str()) {
                Some(handler) => handler(&mut config, &pragma.value),
                None => false,
            };
            if !handled {
                return Err(RuntimeError(
                    pat_preprocess::Error::PragmaFailed {
                        key: pragma.key.clone(),
                        value: pragma.value.clone(),
                        location: pragma.location,
                    }
                    .into_diagnostic(),
                ));
            }
        }
        self.config = config;

        let parsed = pat_parser::parse(preprocessed.tokens).map_err(|mut diags| RuntimeError(diags.remove(0)))?;
        let validated =
            pat_validate::validate(parsed, self.config.recursion_limit).map_err(|mut diags| RuntimeError(diags.remove(0)))?;
        self.ast = validated.statements.clone();
        self.types = validated.types.clone();
        Ok(validated)
    }

    fn evaluate(
        &mut self,
        output: pat_parser::ParseOutput,
        env: AHashMap<String, Literal>,
        in_vars: AHashMap<String, Literal>,
    ) -> Result<(), RuntimeError> {
        let mut eval = self.build_evaluator(output.types, env, in_vars);
        eval.run(&output.statements).map_err(|e| RuntimeError(e.into_diagnostic()))?;
        self.collect_from(&eval);
        Ok(())
    }

    fn build_evaluator(&mut self, types: AHashMap<String, Node>, env: AHashMap<String, Literal>, in_vars: AHashMap<String, Literal>) -> Evaluator {
        let main = Box::new(InMemorySection::with_data(self.data.clone(), self.data.len() as u64));
        let mut eval = Evaluator::new(main, types, self.config.limits).with_env(env).with_in_vars(in_vars);
        eval.set_default_endian(self.config.default_endian);
        eval = eval.with_abort_flag(self.aborted.clone());
        if let Some(handler) = self.dangerous_handler.clone() {
            eval.set_dangerous_handler(handler);
        }
        builtins::install_defaults(&mut eval);
        for (name, extra) in &self.extra_functions {
            eval.register_function(
                name.clone(),
                FunctionRecord {
                    min_params: extra.min,
                    max_params: extra.max,
                    defaults: Vec::new(),
                    dangerous: extra.dangerous,
                    body: FunctionBody::Builtin(extra.callback.clone()),
                },
            );
        }
        eval
    }

    fn collect_from(&mut self, eval: &Evaluator) {
        self.patterns = eval.patterns().to_vec();
        self.console_log = eval.console_log().to_vec();
        self.out_vars = eval.out_vars().clone();
        self.created_pattern_count = self.patterns.len() as u32;
    }

    /// Finishes a run: on error, discards any partial patterns created
    /// before the failure but keeps the console log they produced along
    /// the way.
    fn finish(&mut self, result: Result<(), RuntimeError>) -> bool {
        match result {
            Ok(()) => {
                self.error = None;
                true
            }
            Err(err) => {
                self.patterns.clear();
                self.error = Some(err);
                false
            }
        }
    }
}
