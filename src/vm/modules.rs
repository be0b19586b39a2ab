// Built-in modules every worker VM registers.

use std::sync::Arc;

use rhai::ImmutableString;

use super::Module;

/// `log::info(msg)`, `log::warn(msg)`, `log::error(msg)`.
///
/// Script output goes to `tracing` under the `monkey::script` target.
pub struct LogModule;

impl Module for LogModule {
    fn name(&self) -> &str {
        "log"
    }

    fn exports(&self) -> rhai::Module {
        let mut module = rhai::Module::new();
        module.set_native_fn("info", |msg: ImmutableString| {
            tracing::info!(target: "monkey::script", "{}", msg);
            Ok(())
        });
        module.set_native_fn("warn", |msg: ImmutableString| {
            tracing::warn!(target: "monkey::script", "{}", msg);
            Ok(())
        });
        module.set_native_fn("error", |msg: ImmutableString| {
            tracing::error!(target: "monkey::script", "{}", msg);
            Ok(())
        });
        module
    }
}

/// `time::now()` returns the current UTC time as an RFC 3339 string.
pub struct TimeModule;

impl Module for TimeModule {
    fn name(&self) -> &str {
        "time"
    }

    fn exports(&self) -> rhai::Module {
        let mut module = rhai::Module::new();
        module.set_native_fn("now", || Ok(chrono::Utc::now().to_rfc3339()));
        module
    }
}

/// Modules registered on every VM the service builds.
pub fn default_modules() -> Vec<Arc<dyn Module>> {
    vec![Arc::new(LogModule), Arc::new(TimeModule)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_module_names() {
        let names: Vec<String> = default_modules()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["log".to_string(), "time".to_string()]);
    }
}
