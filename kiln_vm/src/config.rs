//! Runtime configuration.

use kiln_core::KilnError;
use kiln_gc::HeapConfig;
use kiln_jit::JitConfig;
use thiserror::Error;

/// Default maximum call depth per execution context.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 1_024;

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The compiled-tier configuration is unusable.
    #[error("jit: {0}")]
    Jit(String),

    /// A limit that must be positive is zero.
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
}

impl From<ConfigError> for KilnError {
    fn from(err: ConfigError) -> Self {
        KilnError::Config {
            message: err.to_string(),
        }
    }
}

/// Deoptimization policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptConfig {
    /// After this many deoptimizations of one method version it is only
    /// compiled without speculation.
    ///
    /// Default: 3
    pub recompile_after_deopts: u32,
}

impl Default for DeoptConfig {
    fn default() -> Self {
        Self {
            recompile_after_deopts: 3,
        }
    }
}

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// # Example
///
/// ```
/// use kiln_vm::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     max_stack_depth: 256,
///     ..RuntimeConfig::eager_jit()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Compiled tier.
    pub jit: JitConfig,

    /// Object heap.
    pub heap: HeapConfig,

    /// Deoptimization policy.
    pub deopt: DeoptConfig,

    /// Maximum call depth per context.
    ///
    /// Default: 1024
    pub max_stack_depth: usize,

    /// Abort the process on an internal consistency failure.
    ///
    /// Default: true
    pub abort_on_internal_error: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit: JitConfig::default(),
            heap: HeapConfig::default(),
            deopt: DeoptConfig::default(),
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            abort_on_internal_error: true,
        }
    }
}

impl RuntimeConfig {
    /// Never leave the interpreter.
    pub fn interpreter_only() -> Self {
        Self {
            jit: JitConfig::disabled(),
            ..Default::default()
        }
    }

    /// Compile after a couple of calls or loop iterations.
    pub fn eager_jit() -> Self {
        Self {
            jit: JitConfig::eager(),
            ..Default::default()
        }
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.jit.validate().map_err(ConfigError::Jit)?;
        if self.max_stack_depth == 0 {
            return Err(ConfigError::ZeroLimit("max_stack_depth"));
        }
        if self.deopt.recompile_after_deopts == 0 {
            return Err(ConfigError::ZeroLimit("recompile_after_deopts"));
        }
        Ok(())
    }
}
