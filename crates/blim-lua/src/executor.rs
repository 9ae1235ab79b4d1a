//! Command-line style script execution.

use crate::context::ExecContext;
use crate::engine::ScriptEngine;
use crate::error::ScriptError;
use blim_runtime::output::{OutputDrainer, DEFAULT_FINAL_DRAIN};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

type BoxWriter = Box<dyn Write + Send>;

/// Runs scripts on an engine while streaming their output to writers.
///
/// # Example
///
/// ```
/// use blim_lua::{ExecContext, ScriptEngine, ScriptExecutor};
///
/// let executor = ScriptExecutor::new(ScriptEngine::with_defaults()?);
/// executor.run(
///     &ExecContext::background(),
///     r#"print("args: " .. #arg)"#,
///     &["a".to_string()],
///     Box::new(std::io::stdout()),
///     Box::new(std::io::stderr()),
/// )?;
/// # Ok::<(), blim_lua::ScriptError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    engine: ScriptEngine,
    final_drain: Duration,
}

impl ScriptExecutor {
    #[must_use]
    pub fn new(engine: ScriptEngine) -> Self {
        Self {
            engine,
            final_drain: DEFAULT_FINAL_DRAIN,
        }
    }

    /// How long output still queued at the end of a run keeps being copied.
    #[must_use]
    pub fn with_final_drain(mut self, final_drain: Duration) -> Self {
        self.final_drain = final_drain;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    /// Executes `script` with `args`, copying its output to the writers.
    ///
    /// Empty `script` runs the chunk already loaded on the engine.
    #[tracing::instrument(skip_all, fields(len = script.len(), args = args.len()))]
    pub fn run(
        &self,
        ctx: &ExecContext,
        script: &str,
        args: &[String],
        stdout: BoxWriter,
        stderr: BoxWriter,
    ) -> Result<(), ScriptError> {
        let drainer = OutputDrainer::start(&self.engine.output(), stdout, stderr, self.final_drain)
            .map_err(|e| {
                ScriptError::api(format!("cannot start output drainer: {e}")).with_cause(e)
            })?;
        let result = self.engine.execute_script_with_args(ctx, script, args);
        if drainer.stop().is_none() {
            debug!("output drainer ended abnormally");
        }
        result
    }

    /// Loads `path` and runs it like [`run`](Self::run).
    pub fn run_file(
        &self,
        ctx: &ExecContext,
        path: impl AsRef<Path>,
        args: &[String],
        stdout: BoxWriter,
        stderr: BoxWriter,
    ) -> Result<(), ScriptError> {
        self.engine.load_script_file(path)?;
        self.run(ctx, "", args, stdout, stderr)
    }
}
