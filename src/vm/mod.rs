//! Scripting VM execution contract.
//!
//! A build's logic is a user-supplied script. The worker never depends on a
//! concrete interpreter outside this module: everything else talks to the
//! three traits below.
//!
//! - [`Module`]: a named capability registered with a VM host.
//! - [`Vm`]: accumulates modules and compiles a script file into a [`Context`].
//! - [`Context`]: a compiled unit whose functions can be invoked either with
//!   the interpreter's native values ([`Context::call`]) or with host values
//!   ([`Context::call_host`]), which are marshalled in both directions.
//!
//! Compiling is expensive relative to calling, so compiled contexts are
//! shared through [`crate::cache::ContextCache`].

mod engine;
mod modules;
mod source;

pub use engine::{RhaiVm, SandboxLimits, ScriptContext};
pub use modules::{LogModule, TimeModule, default_modules};
pub use source::{DirectorySource, ScriptSource};

pub use rhai::Dynamic;

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// A named capability exposed to scripts.
///
/// From the VM's point of view a module is stateless: it has a name, unique
/// within one VM, and a set of native functions it contributes. Scripts reach
/// those functions as `<name>::<function>(..)`.
pub trait Module: Send + Sync {
    /// Returns the module's name.
    fn name(&self) -> &str;

    /// Native functions this module contributes to compiled scripts.
    fn exports(&self) -> rhai::Module {
        rhai::Module::new()
    }
}

/// A scripting host that compiles script files against registered modules.
pub trait Vm: Send + Sync {
    /// Register a single module.
    fn register(&mut self, module: Arc<dyn Module>) -> Result<(), VmError>;

    /// Register several modules, stopping at the first failure.
    fn register_all(&mut self, modules: Vec<Arc<dyn Module>>) -> Result<(), VmError> {
        for module in modules {
            self.register(module)?;
        }
        Ok(())
    }

    /// Compile the script identified by `file` into a callable context.
    fn compile(&self, file: &str) -> Result<Arc<dyn Context>, VmError>;
}

/// A compiled, callable script unit.
///
/// Both methods are synchronous and may run for as long as the script's
/// sandbox limits allow; async callers should invoke them from
/// `tokio::task::spawn_blocking`.
pub trait Context: Send + Sync {
    /// Identifier of the script file this context was compiled from.
    fn file(&self) -> &str;

    /// Invoke `function` with native interpreter values.
    fn call(&self, function: &str, args: Vec<Dynamic>) -> Result<Dynamic, InvocationError>;

    /// Invoke `function` with host values, marshalling arguments and result.
    fn call_host(&self, function: &str, args: Vec<Value>) -> Result<Value, InvocationError>;
}

/// Errors raised while registering modules or compiling scripts.
#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("module `{0}` is already registered")]
    DuplicateModule(String),

    #[error("invalid script file identifier `{file}`: {reason}")]
    InvalidFile { file: String, reason: String },

    #[error("failed to load script `{file}`: {message}")]
    Load { file: String, message: String },

    #[error("failed to compile script `{file}`: {message}")]
    Compile { file: String, message: String },
}

/// Errors raised while invoking a function of a compiled context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("function `{0}` not found")]
    FunctionNotFound(String),

    #[error("bad call to `{function}`: {message}")]
    Mismatch { function: String, message: String },

    #[error("`{function}` failed: {message}")]
    Runtime { function: String, message: String },

    #[error("cannot convert value: {0}")]
    Marshal(String),

    #[error("script execution was cancelled")]
    Cancelled,
}
