//! Rhai-backed implementation of the VM contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Context, InvocationError, Module, ScriptSource, Vm, VmError};

/// Resource bounds applied to every compiled script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Maximum operations per call (0 = unlimited).
    pub max_operations: u64,
    /// Maximum function call nesting.
    pub max_call_levels: usize,
    /// Maximum expression nesting at global level.
    pub max_expr_depth: usize,
    /// Maximum expression nesting inside functions.
    pub max_function_expr_depth: usize,
    /// Maximum string length in bytes.
    pub max_string_size: usize,
    /// Maximum array length.
    pub max_array_size: usize,
    /// Maximum object map size.
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 5_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
        }
    }
}

/// VM host that compiles scripts with a sandboxed rhai engine.
///
/// Each compiled context gets its own engine built from the modules
/// registered at the time of compilation.
pub struct RhaiVm {
    modules: BTreeMap<String, Arc<dyn Module>>,
    source: Arc<dyn ScriptSource>,
    limits: SandboxLimits,
    cancel: Option<CancellationToken>,
}

impl RhaiVm {
    pub fn new(source: Arc<dyn ScriptSource>) -> Self {
        Self {
            modules: BTreeMap::new(),
            source,
            limits: SandboxLimits::default(),
            cancel: None,
        }
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Abort running scripts once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Names of registered modules, sorted.
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.keys().map(|k| k.as_str()).collect()
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        let limits = &self.limits;
        engine
            .set_max_operations(limits.max_operations)
            .set_max_call_levels(limits.max_call_levels)
            .set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth)
            .set_max_string_size(limits.max_string_size)
            .set_max_array_size(limits.max_array_size)
            .set_max_map_size(limits.max_map_size);

        engine.on_print(|text| tracing::info!(target: "monkey::script", "{}", text));
        engine.on_debug(|text, source, pos| {
            tracing::debug!(target: "monkey::script", source = source.unwrap_or(""), %pos, "{}", text)
        });

        if let Some(token) = self.cancel.clone() {
            engine.on_progress(move |_| token.is_cancelled().then(|| Dynamic::from("cancelled")));
        }

        for (name, module) in &self.modules {
            engine.register_static_module(name.as_str(), Shared::new(module.exports()));
        }

        engine
    }
}

impl Vm for RhaiVm {
    fn register(&mut self, module: Arc<dyn Module>) -> Result<(), VmError> {
        let name = module.name().to_string();
        if self.modules.contains_key(&name) {
            return Err(VmError::DuplicateModule(name));
        }
        self.modules.insert(name, module);
        Ok(())
    }

    fn compile(&self, file: &str) -> Result<Arc<dyn Context>, VmError> {
        let script = self.source.load(file)?;
        let engine = self.build_engine();

        let mut ast = engine.compile(&script).map_err(|e| VmError::Compile {
            file: file.to_string(),
            message: e.to_string(),
        })?;
        ast.set_source(file);

        debug!(file, functions = ast.iter_functions().count(), "Compiled script");

        Ok(Arc::new(ScriptContext {
            file: file.to_string(),
            engine,
            ast,
        }))
    }
}

/// A script compiled by [`RhaiVm`].
pub struct ScriptContext {
    file: String,
    engine: Engine,
    ast: AST,
}

impl ScriptContext {
    fn defines(&self, function: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == function)
    }

    fn invocation_error(&self, function: &str, err: EvalAltResult) -> InvocationError {
        if matches!(innermost(&err), EvalAltResult::ErrorTerminated(..)) {
            return InvocationError::Cancelled;
        }

        match err {
            EvalAltResult::ErrorFunctionNotFound(signature, _) => {
                // The signature reads like "build (i64, string)".
                let called = signature
                    .split(|c: char| c == ' ' || c == '(')
                    .next()
                    .unwrap_or_default();

                if called != function {
                    InvocationError::Runtime {
                        function: function.to_string(),
                        message: format!("function not found: {}", signature),
                    }
                } else if self.defines(function) {
                    InvocationError::Mismatch {
                        function: function.to_string(),
                        message: format!("no definition matches {}", signature),
                    }
                } else {
                    InvocationError::FunctionNotFound(function.to_string())
                }
            }
            EvalAltResult::ErrorMismatchDataType(expected, actual, _)
            | EvalAltResult::ErrorMismatchOutputType(expected, actual, _) => {
                InvocationError::Mismatch {
                    function: function.to_string(),
                    message: format!("expected {}, got {}", expected, actual),
                }
            }
            other => InvocationError::Runtime {
                function: function.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Errors raised inside script functions arrive wrapped once per call frame.
fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => {
            innermost(inner)
        }
        _ => err,
    }
}

impl Context for ScriptContext {
    fn file(&self) -> &str {
        &self.file
    }

    fn call(&self, function: &str, args: Vec<Dynamic>) -> Result<Dynamic, InvocationError> {
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);

        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, function, args)
            .map_err(|e| self.invocation_error(function, *e))
    }

    fn call_host(&self, function: &str, args: Vec<Value>) -> Result<Value, InvocationError> {
        let args = args
            .iter()
            .map(rhai::serde::to_dynamic)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| InvocationError::Marshal(e.to_string()))?;

        let result = self.call(function, args)?;

        rhai::serde::from_dynamic::<Value>(&result)
            .map_err(|e| InvocationError::Marshal(e.to_string()))
    }
}
