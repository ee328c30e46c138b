//! Collector roots owned by the runtime.

use crate::runtime::Runtime;
use kiln_core::Value;
use kiln_gc::{RootKind, RootProvider, Tracer};
use parking_lot::Mutex;

/// Register values a context made visible to the collector.
///
/// Written by the owning context right before it enters a safe state,
/// read by the collector while that context is stopped.
#[derive(Debug, Default)]
pub(crate) struct PublishedRoots {
    values: Mutex<Vec<Value>>,
}

impl PublishedRoots {
    pub(crate) fn publish(&self, values: Vec<Value>) {
        *self.values.lock() = values;
    }

    pub(crate) fn clear(&self) {
        self.values.lock().clear();
    }

    fn trace(&self, tracer: &mut dyn Tracer) {
        for value in self.values.lock().iter() {
            tracer.trace_root(RootKind::Frame, *value);
        }
    }
}

/// Everything the runtime keeps alive: static storage of every loaded
/// type and, unless tearing down, the published frames of every context.
pub(crate) struct RuntimeRoots<'a> {
    runtime: &'a Runtime,
    include_contexts: bool,
}

impl<'a> RuntimeRoots<'a> {
    pub(crate) fn new(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            include_contexts: true,
        }
    }

    /// Statics only.
    pub(crate) fn statics_only(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            include_contexts: false,
        }
    }
}

impl RootProvider for RuntimeRoots<'_> {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for desc in self.runtime.table().all() {
            for value in desc.statics().values() {
                tracer.trace_root(RootKind::StaticField, value);
            }
        }
        if self.include_contexts {
            for entry in self.runtime.contexts.iter() {
                entry.value().trace(tracer);
            }
        }
    }
}
