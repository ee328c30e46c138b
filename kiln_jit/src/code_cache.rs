//! Code cache for storing and indexing compiled methods.
//!
//! The code cache provides:
//! - Lookup of valid compiled code by method version id
//! - A reverse index from each type to the code depending on it, so a
//!   redefinition invalidates exactly the affected code
//! - Install/invalidation statistics

use crate::compiled::{CompiledMethod, InvalidationReason};
use dashmap::DashMap;
use kiln_core::{CodeId, TypeId};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Code cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    /// Compiled methods installed.
    pub installs: u64,
    /// Compiled methods invalidated.
    pub invalidations: u64,
    /// Methods currently cached.
    pub entries: usize,
}

/// All live compiled code.
#[derive(Debug, Default)]
pub struct CodeCache {
    entries: DashMap<CodeId, Arc<CompiledMethod>>,
    dependents: DashMap<TypeId, FxHashSet<CodeId>>,
    installs: AtomicU64,
    invalidations: AtomicU64,
}

impl CodeCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `code`, replacing any previous code for the same version.
    ///
    /// Code that went stale while compiling, because its own version or a
    /// call target it resolved was redefined, is invalidated immediately
    /// and never becomes visible. Dependencies are registered before the
    /// check, so a redefinition racing with the install either finds the
    /// code through its dependencies or is seen by the check.
    pub fn insert(&self, code: CompiledMethod) -> Arc<CompiledMethod> {
        let code = Arc::new(code);
        let id = code.code_id();
        for ty in code.dependencies() {
            self.dependents.entry(*ty).or_default().insert(id);
        }
        if let Some(previous) = self.entries.insert(id, Arc::clone(&code)) {
            self.retire(&previous, InvalidationReason::Explicit);
        }
        self.installs.fetch_add(1, Ordering::Relaxed);
        if code.is_stale() {
            self.remove(id, InvalidationReason::Redefinition);
        }
        code
    }

    /// Valid code for version `id`.
    #[inline]
    pub fn get(&self, id: CodeId) -> Option<Arc<CompiledMethod>> {
        self.entries
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|code| code.is_valid())
    }

    /// Whether valid code exists for version `id`.
    #[inline]
    pub fn contains(&self, id: CodeId) -> bool {
        self.get(id).is_some()
    }

    /// Invalidate and drop the code for version `id`.
    pub fn remove(&self, id: CodeId, reason: InvalidationReason) -> Option<Arc<CompiledMethod>> {
        let (_, code) = self.entries.remove(&id)?;
        self.retire(&code, reason);
        Some(code)
    }

    /// Invalidate every piece of code depending on `ty`. Returns how many
    /// were invalidated.
    pub fn invalidate_dependents(&self, ty: TypeId, reason: InvalidationReason) -> usize {
        let Some((_, ids)) = self.dependents.remove(&ty) else {
            return 0;
        };
        let mut count = 0;
        for id in ids {
            if self.remove(id, reason).is_some() {
                count += 1;
            }
        }
        if count > 0 {
            debug!(type_id = %ty, count, %reason, "compiled code invalidated");
        }
        count
    }

    /// Invalidate and drop everything.
    pub fn clear(&self, reason: InvalidationReason) -> usize {
        let ids: Vec<CodeId> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for id in ids {
            if self.remove(id, reason).is_some() {
                count += 1;
            }
        }
        self.dependents.clear();
        count
    }

    /// Number of cached methods.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current statistics.
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            installs: self.installs.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn retire(&self, code: &CompiledMethod, reason: InvalidationReason) {
        if code.invalidate(reason) {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use kiln_core::bytecode::{CodeBuilder, Reg};
    use kiln_runtime::{ClassTable, MethodFlags, TypeDefinition};

    fn compiled(table: &ClassTable, name: &str) -> (TypeId, CompiledMethod) {
        let mut b = CodeBuilder::new(0);
        b.const_int(Reg(0), 1).ret(Reg(0));
        let ty = table
            .load(TypeDefinition::new(name).method("one", MethodFlags::STATIC, b.finish().unwrap()))
            .unwrap();
        let method = table.get(ty).unwrap().method("one").unwrap();
        (ty, Compiler::default().compile(table, &method).unwrap())
    }

    #[test]
    fn test_insert_and_get() {
        let table = ClassTable::new();
        let cache = CodeCache::new();
        let (_, code) = compiled(&table, "A");
        let id = code.code_id();
        cache.insert(code);
        assert!(cache.contains(id));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().installs, 1);
    }

    #[test]
    fn test_invalidate_dependents_only_hits_dependents() {
        let table = ClassTable::new();
        let cache = CodeCache::new();
        let (a, code_a) = compiled(&table, "A");
        let (_, code_b) = compiled(&table, "B");
        let id_a = code_a.code_id();
        let id_b = code_b.code_id();
        let handle_a = cache.insert(code_a);
        cache.insert(code_b);

        assert_eq!(cache.invalidate_dependents(a, InvalidationReason::Redefinition), 1);
        assert!(!cache.contains(id_a));
        assert!(cache.contains(id_b));
        assert_eq!(handle_a.invalidation(), Some(InvalidationReason::Redefinition));
        assert_eq!(cache.invalidate_dependents(a, InvalidationReason::Redefinition), 0);
    }

    #[test]
    fn test_obsolete_code_never_visible() {
        let table = ClassTable::new();
        let cache = CodeCache::new();
        let (_, code) = compiled(&table, "A");
        code.method().mark_obsolete();
        let id = code.code_id();
        let handle = cache.insert(code);
        assert!(!cache.contains(id));
        assert!(!handle.is_valid());
    }

    #[test]
    fn test_redefined_call_target_never_visible() {
        let table = ClassTable::new();
        let cache = CodeCache::new();
        let mut value = CodeBuilder::new(1);
        value.const_int(Reg(1), 7).ret(Reg(1));
        let a = table
            .load(TypeDefinition::new("A").method("value", MethodFlags::empty(), value.finish().unwrap()))
            .unwrap();
        let mut call = CodeBuilder::new(1);
        call.invoke_virtual(Some(Reg(1)), "value", &[Reg(0)]).ret(Reg(1));
        let caller = table
            .load(TypeDefinition::new("Caller").method("call", MethodFlags::STATIC, call.finish().unwrap()))
            .unwrap();
        let method = table.get(caller).unwrap().method("call").unwrap();
        method.inline_cache().record(0, a);
        let code = Compiler::default().compile(&table, &method).unwrap();
        assert!(code.depends_on(a));

        // A.value is redefined after the compiler resolved it but before
        // the code is installed.
        table.get(a).unwrap().method("value").unwrap().mark_obsolete();
        assert_eq!(cache.invalidate_dependents(a, InvalidationReason::Redefinition), 0);

        let handle = cache.insert(code);
        assert!(!handle.is_valid());
        assert_eq!(handle.invalidation(), Some(InvalidationReason::Redefinition));
        assert!(!cache.contains(method.code_id()));
    }

    #[test]
    fn test_clear() {
        let table = ClassTable::new();
        let cache = CodeCache::new();
        let (_, a) = compiled(&table, "A");
        let (_, b) = compiled(&table, "B");
        cache.insert(a);
        cache.insert(b);
        assert_eq!(cache.clear(InvalidationReason::Explicit), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations, 2);
    }
}
