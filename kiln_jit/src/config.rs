//! Compiler configuration.

/// Default invocation-plus-backedge count that triggers compilation.
pub const DEFAULT_HOTNESS_THRESHOLD: u32 = 1_000;

/// Default backedge count at which a running loop is compiled and entered.
pub const DEFAULT_OSR_THRESHOLD: u32 = 5_000;

/// Configuration for the compiled tier.
///
/// # Example
///
/// ```
/// use kiln_jit::JitConfig;
///
/// let config = JitConfig {
///     hotness_threshold: 10,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Whether methods are ever compiled.
    ///
    /// Default: true
    pub enabled: bool,

    /// Hotness at which a method is compiled on its next entry.
    ///
    /// Default: 1000
    pub hotness_threshold: u32,

    /// Hotness at which an interpreted loop transfers to compiled code.
    ///
    /// Default: 5000
    pub osr_threshold: u32,

    /// Bodies longer than this are never compiled.
    ///
    /// Default: 10000
    pub max_compiled_instructions: usize,

    /// Largest receiver set still served by a polymorphic cache.
    ///
    /// Default: 4
    pub max_polymorphic_targets: usize,

    /// Replace guarded calls to constant-returning methods by the constant.
    ///
    /// Default: true
    pub inline_trivial_targets: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hotness_threshold: DEFAULT_HOTNESS_THRESHOLD,
            osr_threshold: DEFAULT_OSR_THRESHOLD,
            max_compiled_instructions: 10_000,
            max_polymorphic_targets: 4,
            inline_trivial_targets: true,
        }
    }
}

impl JitConfig {
    /// Never compile.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Compile almost immediately. Useful for exercising the compiled tier.
    pub fn eager() -> Self {
        Self {
            hotness_threshold: 2,
            osr_threshold: 50,
            ..Default::default()
        }
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.hotness_threshold == 0 {
            return Err("hotness_threshold must be at least 1".into());
        }
        if self.osr_threshold == 0 {
            return Err("osr_threshold must be at least 1".into());
        }
        if self.max_polymorphic_targets < 2 {
            return Err("max_polymorphic_targets must be at least 2".into());
        }
        if self.max_compiled_instructions == 0 {
            return Err("max_compiled_instructions must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(JitConfig::default().validate().is_ok());
        assert!(JitConfig::eager().validate().is_ok());
        assert!(!JitConfig::disabled().enabled);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let config = JitConfig {
            hotness_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_polymorphic_cache() {
        let config = JitConfig {
            max_polymorphic_targets: 1,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("polymorphic"));
    }
}
