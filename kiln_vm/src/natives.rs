//! Host functions callable from bytecode.
//!
//! `InvokeNative` looks its target up by name. A native receives the
//! calling [`ExecutionContext`], so it can re-enter the runtime: invoke
//! managed methods, redefine types, force a collection or request
//! compilation. Natives run in the `Running` safepoint state; a native
//! that holds object references across a collection must pin them.

use crate::context::ExecutionContext;
use kiln_core::{KilnError, KilnResult, Symbol, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// A host function.
pub type NativeFn =
    Arc<dyn Fn(&mut ExecutionContext, &[Value]) -> KilnResult<Value> + Send + Sync>;

/// Registered natives by name.
#[derive(Default)]
pub struct NativeRegistry {
    functions: RwLock<FxHashMap<Symbol, NativeFn>>,
}

impl NativeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` as `name`, replacing any previous binding.
    pub fn register(&self, name: impl Into<Symbol>, function: NativeFn) {
        self.functions.write().insert(name.into(), function);
    }

    /// The native bound to `name`.
    pub fn get(&self, name: &str) -> KilnResult<NativeFn> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KilnError::no_such_method("<native>", name))
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// Number of registered natives.
    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<Symbol> = self.functions.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("NativeRegistry")
            .field("natives", &names)
            .finish()
    }
}
