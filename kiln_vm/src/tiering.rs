//! Tier policy.
//!
//! Decides, at method entry and at backward branches, whether a frame
//! keeps interpreting, enters existing compiled code, or triggers a
//! compilation first.
//!
//! ```text
//!   entry ──► valid code cached? ──yes──► enter compiled at pc 0
//!               │ no
//!               ▼
//!           hotness += 1 ──► ≥ hotness_threshold ──► compile ──► enter
//!
//!   back edge ──► valid code cached? ──yes──► OSR at loop header
//!                   │ no
//!                   ▼
//!               hotness += 1 ──► ≥ osr_threshold ──► compile ──► OSR
//! ```
//!
//! A method whose compilation fails permanently is marked never-compile;
//! its hotness counter is reset and frozen at zero.

use crate::runtime::Runtime;
use kiln_jit::{CompileError, CompiledMethod};
use kiln_runtime::MethodVersion;
use std::sync::Arc;
use tracing::{debug, warn};

impl Runtime {
    /// Compiled code to run a new frame of `method` with, if any.
    pub(crate) fn tier_on_entry(&self, method: &Arc<MethodVersion>) -> Option<Arc<CompiledMethod>> {
        self.promote(method, self.config().jit.hotness_threshold)
    }

    /// Compiled code to transfer an interpreted frame of `method` to at a
    /// loop header, if any.
    pub(crate) fn tier_on_backedge(
        &self,
        method: &Arc<MethodVersion>,
    ) -> Option<Arc<CompiledMethod>> {
        self.promote(method, self.config().jit.osr_threshold)
    }

    fn promote(&self, method: &Arc<MethodVersion>, threshold: u32) -> Option<Arc<CompiledMethod>> {
        if let Some(code) = self.code_cache.get(method.code_id()) {
            return Some(code);
        }
        let hotness = method.hotness().increment();
        if !self.config().jit.enabled
            || hotness < threshold
            || !method.is_compilable()
            || method.is_obsolete()
        {
            return None;
        }
        self.compile_method(method).ok()
    }

    /// Compile `method` and install the result, unless valid code is
    /// already installed.
    pub(crate) fn compile_method(
        &self,
        method: &Arc<MethodVersion>,
    ) -> Result<Arc<CompiledMethod>, CompileError> {
        let _serial = self.compile_lock.lock();
        if let Some(code) = self.code_cache.get(method.code_id()) {
            return Ok(code);
        }
        match self.compiler.compile(self.table(), method) {
            Ok(code) => {
                let code = self.code_cache.insert(code);
                if !code.is_valid() {
                    return Err(CompileError::Obsolete {
                        method: method.name().clone(),
                    });
                }
                method.hotness().reset();
                debug!(
                    method = %method.name(),
                    code = %method.code_id(),
                    speculative = code.is_speculative(),
                    "method compiled"
                );
                self.events().method_compiled(method);
                Ok(code)
            }
            Err(err) => {
                if err.is_permanent() {
                    warn!(method = %method.name(), %err, "method stays interpreted");
                    method.mark_never_compile();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Runtime, RuntimeConfig};
    use kiln_core::bytecode::{CodeBuilder, Reg};
    use kiln_jit::JitConfig;
    use kiln_runtime::{MethodFlags, TypeDefinition};

    fn config(threshold: u32) -> RuntimeConfig {
        RuntimeConfig {
            jit: JitConfig {
                hotness_threshold: threshold,
                ..JitConfig::default()
            },
            ..Default::default()
        }
    }

    fn answer() -> TypeDefinition {
        let mut b = CodeBuilder::new(0);
        b.const_int(Reg(0), 42).ret(Reg(0));
        TypeDefinition::new("Answer").method("get", MethodFlags::STATIC, b.finish().unwrap())
    }

    #[test]
    fn test_entry_promotes_at_threshold() {
        let rt = Runtime::new(config(3)).unwrap();
        let ty = rt.load_type(answer()).unwrap();
        let method = rt.find_method(ty, "get").unwrap();
        assert!(rt.tier_on_entry(&method).is_none());
        assert!(rt.tier_on_entry(&method).is_none());
        assert!(rt.tier_on_entry(&method).is_some());
        assert_eq!(method.hotness().value(), 0);
        // Cached code is reused without touching the counter.
        assert!(rt.tier_on_entry(&method).is_some());
        assert_eq!(method.hotness().value(), 0);
    }

    #[test]
    fn test_disabled_jit_only_counts() {
        let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
        let ty = rt.load_type(answer()).unwrap();
        let method = rt.find_method(ty, "get").unwrap();
        for _ in 0..5_000 {
            assert!(rt.tier_on_entry(&method).is_none());
        }
        assert_eq!(method.hotness().value(), 5_000);
    }

    #[test]
    fn test_too_large_freezes_hotness() {
        let mut cfg = config(2);
        cfg.jit.max_compiled_instructions = 1;
        let rt = Runtime::new(cfg).unwrap();
        let ty = rt.load_type(answer()).unwrap();
        let method = rt.find_method(ty, "get").unwrap();
        for _ in 0..10 {
            assert!(rt.tier_on_entry(&method).is_none());
        }
        assert!(!method.is_compilable());
        assert_eq!(method.hotness().value(), 0);
    }
}
