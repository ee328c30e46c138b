//! Live redefinition of types.
//!
//! ```text
//!   request(s) ──► redefine_lock ──► validate every request
//!                                        │ any rejection: nothing changes
//!                                        ▼
//!                                  stop the world
//!                                        │
//!        ┌───────────────────────────────┼────────────────────────────┐
//!        ▼                               ▼                            ▼
//!  new MethodVersion per slot   invalidate dependent code   clear inline caches
//!  (old version obsolete)       and the old versions' code  naming the type
//!                                        │
//!                                        ▼
//!                              definition swapped, world resumes
//! ```
//!
//! Frames already running an old version keep their `Arc<MethodVersion>`
//! and finish with the old body. New calls resolve through the slot and
//! get the new version. Statics and instances are never touched, which is
//! why any change to the field layout is rejected.

use crate::context::ExecutionContext;
use crate::runtime::Runtime;
use kiln_core::bytecode::{CodeBody, verify_body};
use kiln_core::{ContextId, KilnError, KilnResult, RedefinitionFailure, Symbol, TypeId};
use kiln_jit::InvalidationReason;
use kiln_runtime::{OBJECT_NAME, TypeDefinition, TypeDescriptor};
use parking_lot::MutexGuard;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Rewrites definitions during [`Runtime::retransform`].
pub trait ClassTransformer: Send + Sync {
    /// A replacement for `current`, or `None` to leave it as is.
    fn transform(&self, ty: TypeId, current: &TypeDefinition) -> Option<TypeDefinition>;
}

impl Runtime {
    /// Replace the methods of `ty` with those of `def`.
    pub fn redefine(&self, ty: TypeId, def: TypeDefinition) -> KilnResult<()> {
        self.redefine_many(vec![(ty, def)])
    }

    /// Redefine several types at once: all are validated before any is
    /// changed, and either all change or none does.
    ///
    /// Fails with `IllegalStateException` on a thread running managed code
    /// (a native); use [`ExecutionContext::redefine_many`] there.
    pub fn redefine_many(&self, requests: Vec<(TypeId, TypeDefinition)>) -> KilnResult<()> {
        self.check_host_thread("redefine")?;
        let serial = self.redefine_lock.lock();
        self.redefine_locked(None, requests, serial)
    }

    /// Run the registered transformers over the current definition of
    /// `ty` and redefine it with the result.
    pub fn retransform(&self, ty: TypeId) -> KilnResult<()> {
        let def = self.transformed(ty)?;
        self.redefine(ty, def)
    }

    pub(crate) fn transformed(&self, ty: TypeId) -> KilnResult<TypeDefinition> {
        let mut def = (*self.table().get(ty)?.definition()).clone();
        for transformer in self.transformers.read().iter() {
            if let Some(next) = transformer.transform(ty, &def) {
                def = next;
            }
        }
        Ok(def)
    }

    pub(crate) fn redefine_locked(
        &self,
        requester: Option<ContextId>,
        requests: Vec<(TypeId, TypeDefinition)>,
        _serial: MutexGuard<'_, ()>,
    ) -> KilnResult<()> {
        let mut seen = FxHashSet::default();
        let mut validated = Vec::with_capacity(requests.len());
        for (ty, def) in requests {
            if !seen.insert(ty) {
                return Err(KilnError::class_format(format!(
                    "{ty} appears twice in one redefinition"
                )));
            }
            let desc = self.table().get(ty)?;
            if let Err(err) = validate(&desc, &def) {
                warn!(ty = %desc.name(), %err, "redefinition rejected");
                return Err(err);
            }
            validated.push((desc, def));
        }

        let mut committed = Vec::with_capacity(validated.len());
        {
            let _pause = self.safepoints().stop_the_world(requester);
            for (desc, def) in validated {
                let replaced = self.commit(&desc, def)?;
                committed.push((desc, replaced));
            }
        }

        let events = self.events();
        for (desc, replaced) in committed {
            info!(
                ty = %desc.name(),
                methods = replaced,
                redefinitions = desc.redefinition_count(),
                "type redefined"
            );
            events.class_redefined(desc.id(), desc.name());
        }
        Ok(())
    }

    /// Install `def` for `desc`. The world is stopped.
    fn commit(&self, desc: &Arc<TypeDescriptor>, def: TypeDefinition) -> KilnResult<usize> {
        let ty = desc.id();
        for method in &def.methods {
            let slot = desc.method_slot(&method.name).ok_or_else(|| {
                KilnError::internal(format!(
                    "validated redefinition of {} lost method {}",
                    desc.name(),
                    method.name
                ))
            })?;
            let old = slot.replace(self.table().new_version(ty, method));
            self.code_cache
                .remove(old.code_id(), InvalidationReason::Redefinition);
        }
        self.code_cache
            .invalidate_dependents(ty, InvalidationReason::Redefinition);
        for other in self.table().all() {
            for method in other.current_methods() {
                method.inline_cache().clear_involving(ty);
            }
        }
        let replaced = def.methods.len();
        desc.set_definition(def);
        Ok(replaced)
    }
}

impl ExecutionContext {
    /// Redefine `ty` from inside this context. A managed frame of `ty`
    /// that is running right now keeps running its old code.
    pub fn redefine(&mut self, ty: TypeId, def: TypeDefinition) -> KilnResult<()> {
        self.redefine_many(vec![(ty, def)])
    }

    /// [`Runtime::redefine_many`] from inside this context.
    pub fn redefine_many(&mut self, requests: Vec<(TypeId, TypeDefinition)>) -> KilnResult<()> {
        let runtime = Arc::clone(&self.runtime);
        let serial = match runtime.redefine_lock.try_lock() {
            Some(serial) => serial,
            None => self.blocking(|| runtime.redefine_lock.lock()),
        };
        self.publish_roots();
        runtime.redefine_locked(Some(self.id()), requests, serial)
    }

    /// [`Runtime::retransform`] from inside this context.
    pub fn retransform(&mut self, ty: TypeId) -> KilnResult<()> {
        let def = self.runtime.transformed(ty)?;
        self.redefine(ty, def)
    }
}

// =============================================================================
// Validation
// =============================================================================

fn unsupported(kind: RedefinitionFailure, message: String) -> KilnResult<()> {
    Err(KilnError::unsupported_redefinition(kind, message))
}

fn verify(type_name: &str, method: &str, body: &CodeBody) -> KilnResult<()> {
    verify_body(body)
        .map_err(|err| KilnError::verification(format!("{type_name}.{method}: {err}")))
}

fn superclass_name(def: &TypeDefinition) -> &str {
    def.superclass.as_deref().unwrap_or(OBJECT_NAME)
}

/// Check that `new` only changes method bodies of `desc`.
fn validate(desc: &TypeDescriptor, new: &TypeDefinition) -> KilnResult<()> {
    let old = desc.definition();
    let name = &old.name;

    if new.name != old.name {
        return unsupported(
            RedefinitionFailure::NamesDontMatch,
            format!("{name} cannot be redefined as {}", new.name),
        );
    }

    let mut declared = FxHashSet::default();
    for method in &new.methods {
        if !declared.insert(&method.name) {
            return Err(KilnError::class_format(format!(
                "{name} declares {} twice",
                method.name
            )));
        }
        verify(name, &method.name, &method.body)?;
    }
    if let Some(body) = &new.clinit {
        verify(name, "<clinit>", body)?;
    }

    if superclass_name(&old) != superclass_name(new) {
        return unsupported(
            RedefinitionFailure::HierarchyChanged,
            format!("{name}: superclass changed"),
        );
    }
    if old.interfaces != new.interfaces {
        return unsupported(
            RedefinitionFailure::HierarchyChanged,
            format!("{name}: interfaces changed"),
        );
    }
    if old.flags != new.flags {
        return unsupported(
            RedefinitionFailure::ModifiersChanged,
            format!("{name}: {:?} -> {:?}", old.flags, new.flags),
        );
    }
    if old.instance_fields != new.instance_fields {
        return unsupported(
            RedefinitionFailure::SchemaChanged,
            format!("{name}: instance fields changed"),
        );
    }
    let old_statics: FxHashSet<&Symbol> = old.static_fields.iter().map(|f| &f.name).collect();
    let new_statics: FxHashSet<&Symbol> = new.static_fields.iter().map(|f| &f.name).collect();
    if old_statics != new_statics {
        return unsupported(
            RedefinitionFailure::SchemaChanged,
            format!("{name}: static fields changed"),
        );
    }

    for method in &old.methods {
        match new.find_method(&method.name) {
            None => {
                return unsupported(
                    RedefinitionFailure::MethodDeleted,
                    format!("{name}.{}", method.name),
                );
            }
            Some(replacement)
                if replacement.flags != method.flags || replacement.arity() != method.arity() =>
            {
                return unsupported(
                    RedefinitionFailure::MethodModifiersChanged,
                    format!("{name}.{}", method.name),
                );
            }
            Some(_) => {}
        }
    }
    if let Some(added) = new
        .methods
        .iter()
        .find(|method| old.find_method(&method.name).is_none())
    {
        return unsupported(
            RedefinitionFailure::MethodAdded,
            format!("{name}.{}", added.name),
        );
    }
    Ok(())
}
