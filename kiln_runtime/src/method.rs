//! Versioned methods.
//!
//! Every method of a loaded type lives in a [`MethodSlot`], an indirection
//! cell holding the current [`MethodVersion`]. Call sites resolve through
//! the slot on every call; a frame captures the `Arc<MethodVersion>` it
//! started with and keeps it for its whole activation.
//!
//! ```text
//!   MethodSlot ──current──► MethodVersion (code#12)   ◄── new calls
//!                           MethodVersion (code#7, obsolete) ◄── old frame
//! ```
//!
//! Redefinition swaps the slot's pointer and marks the old version
//! obsolete. The old version's body is immutable, so frames running it
//! finish with the code they started.

use crate::definition::MethodFlags;
use crate::hotness::HotnessCounter;
use crate::inline_cache::InlineCache;
use kiln_core::bytecode::CodeBody;
use kiln_core::{CodeId, Symbol, TypeId};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

/// Whether and how a method version may be compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompileState {
    /// May be compiled with speculation.
    Eligible = 0,
    /// Deoptimized too often; compiled without speculation only.
    NoSpeculation = 1,
    /// Compilation failed or is disallowed; always interpreted.
    Never = 2,
}

impl CompileState {
    #[inline]
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Eligible,
            1 => Self::NoSpeculation,
            _ => Self::Never,
        }
    }
}

/// One version of a method body.
pub struct MethodVersion {
    code_id: CodeId,
    declaring: TypeId,
    name: Symbol,
    flags: MethodFlags,
    body: Arc<CodeBody>,
    obsolete: AtomicBool,
    compile_state: AtomicU8,
    deopts: AtomicU32,
    hotness: HotnessCounter,
    inline_cache: InlineCache,
}

impl MethodVersion {
    /// Create a fresh, non-obsolete version.
    pub fn new(
        code_id: CodeId,
        declaring: TypeId,
        name: Symbol,
        flags: MethodFlags,
        body: CodeBody,
    ) -> Self {
        let version = Self {
            code_id,
            declaring,
            name,
            flags,
            body: Arc::new(body),
            obsolete: AtomicBool::new(false),
            compile_state: AtomicU8::new(CompileState::Eligible as u8),
            deopts: AtomicU32::new(0),
            hotness: HotnessCounter::new(),
            inline_cache: InlineCache::new(),
        };
        if flags.contains(MethodFlags::NON_COMPILABLE) {
            version.mark_never_compile();
        }
        version
    }

    /// Identity of this version.
    #[inline]
    pub fn code_id(&self) -> CodeId {
        self.code_id
    }

    /// Type declaring the method.
    #[inline]
    pub fn declaring(&self) -> TypeId {
        self.declaring
    }

    /// Method name.
    #[inline]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    /// Modifiers.
    #[inline]
    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    /// Whether the method takes no receiver.
    #[inline]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Whether the method is private to its declaring type.
    #[inline]
    pub fn is_private(&self) -> bool {
        self.flags.contains(MethodFlags::PRIVATE)
    }

    /// The bytecode.
    #[inline]
    pub fn body(&self) -> &Arc<CodeBody> {
        &self.body
    }

    /// Declared parameter count, receiver included.
    #[inline]
    pub fn arity(&self) -> usize {
        self.body.params as usize
    }

    /// Whether a redefinition superseded this version.
    #[inline]
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Mark this version superseded. Obsolete versions are never compiled.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
        self.mark_never_compile();
    }

    /// Current compile state.
    #[inline]
    pub fn compile_state(&self) -> CompileState {
        CompileState::from_u8(self.compile_state.load(Ordering::Acquire))
    }

    /// Whether the compiler may be asked for this version.
    #[inline]
    pub fn is_compilable(&self) -> bool {
        self.compile_state() != CompileState::Never
    }

    /// Make this version permanently interpreted. Freezes its counter.
    pub fn mark_never_compile(&self) {
        self.compile_state
            .store(CompileState::Never as u8, Ordering::Release);
        self.hotness.freeze();
    }

    /// Stop speculating for this version.
    pub fn disable_speculation(&self) {
        let _ = self.compile_state.compare_exchange(
            CompileState::Eligible as u8,
            CompileState::NoSpeculation as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Count a deoptimization and return the new total.
    #[inline]
    pub fn record_deopt(&self) -> u32 {
        self.deopts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Deoptimizations of this version so far.
    #[inline]
    pub fn deopt_count(&self) -> u32 {
        self.deopts.load(Ordering::Relaxed)
    }

    /// The hotness counter.
    #[inline]
    pub fn hotness(&self) -> &HotnessCounter {
        &self.hotness
    }

    /// Receiver profiles of this version's call sites.
    #[inline]
    pub fn inline_cache(&self) -> &InlineCache {
        &self.inline_cache
    }
}

impl fmt::Debug for MethodVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodVersion")
            .field("code_id", &self.code_id)
            .field("declaring", &self.declaring)
            .field("name", &self.name)
            .field("obsolete", &self.is_obsolete())
            .field("compile_state", &self.compile_state())
            .finish_non_exhaustive()
    }
}

/// Indirection cell resolving a method to its current version.
#[derive(Debug)]
pub struct MethodSlot {
    current: RwLock<Arc<MethodVersion>>,
}

impl MethodSlot {
    /// A slot pointing at `version`.
    pub fn new(version: MethodVersion) -> Self {
        Self {
            current: RwLock::new(Arc::new(version)),
        }
    }

    /// The version new calls dispatch to.
    #[inline]
    pub fn current(&self) -> Arc<MethodVersion> {
        Arc::clone(&self.current.read())
    }

    /// Install `version` and return the one it replaced, now obsolete.
    pub fn replace(&self, version: MethodVersion) -> Arc<MethodVersion> {
        let old = std::mem::replace(&mut *self.current.write(), Arc::new(version));
        old.mark_obsolete();
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::bytecode::{CodeBuilder, Reg};

    fn version(code: u64, flags: MethodFlags) -> MethodVersion {
        let mut b = CodeBuilder::new(0);
        b.const_int(Reg(0), code as i64).ret(Reg(0));
        MethodVersion::new(
            CodeId::new(code),
            TypeId(3),
            "value".into(),
            flags,
            b.finish().unwrap(),
        )
    }

    #[test]
    fn test_slot_replacement_marks_obsolete() {
        let slot = MethodSlot::new(version(1, MethodFlags::empty()));
        let held = slot.current();
        let old = slot.replace(version(2, MethodFlags::empty()));

        assert!(Arc::ptr_eq(&held, &old));
        assert!(held.is_obsolete());
        assert!(!held.is_compilable());
        assert_eq!(slot.current().code_id(), CodeId::new(2));
        assert!(!slot.current().is_obsolete());
        // The captured version keeps its own body.
        assert_eq!(held.body().len(), 2);
    }

    #[test]
    fn test_non_compilable_freezes_hotness() {
        let v = version(1, MethodFlags::NON_COMPILABLE);
        assert_eq!(v.compile_state(), CompileState::Never);
        v.hotness().increment();
        assert_eq!(v.hotness().value(), 0);
    }

    #[test]
    fn test_disable_speculation_only_from_eligible() {
        let v = version(1, MethodFlags::empty());
        v.disable_speculation();
        assert_eq!(v.compile_state(), CompileState::NoSpeculation);
        assert!(v.is_compilable());

        let never = version(2, MethodFlags::NON_COMPILABLE);
        never.disable_speculation();
        assert_eq!(never.compile_state(), CompileState::Never);
    }

    #[test]
    fn test_deopt_count() {
        let v = version(1, MethodFlags::STATIC);
        assert!(v.is_static());
        assert_eq!(v.record_deopt(), 1);
        assert_eq!(v.record_deopt(), 2);
        assert_eq!(v.deopt_count(), 2);
    }
}
