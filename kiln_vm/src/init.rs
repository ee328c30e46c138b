//! Type initialization.
//!
//! ```text
//!   try_begin ──► Ready / Recursive ──► usable
//!       │
//!       ├──► Failed(cause) ──► InitializationError (sticky)
//!       │
//!       ├──► InProgress ──► wait (Blocked) ──► terminal state
//!       │
//!       └──► Run ──► superclass ──► static initial values ──► <clinit>
//!                                                    │
//!                                  complete ◄── ok ──┴── err ──► fail
//! ```
//!
//! Exactly one context wins the claim in `try_begin`; everyone else waits
//! on the cell's condition variable in the `Blocked` safepoint state.

use crate::context::ExecutionContext;
use crate::runtime::Runtime;
use kiln_core::{KilnError, KilnResult, TypeId};
use kiln_runtime::{InitAction, TypeDescriptor};
use std::sync::Arc;
use tracing::{debug, trace};

impl Runtime {
    /// Initialize `ty` on a short-lived context of its own.
    ///
    /// Fails with `IllegalStateException` on a thread running managed code:
    /// the fresh context could end up waiting for an initializer the
    /// calling context itself is running. Use
    /// [`ExecutionContext::initialize`] there.
    pub fn initialize(self: &Arc<Self>, ty: TypeId) -> KilnResult<()> {
        self.check_host_thread("initialize")?;
        self.attach().initialize(ty)
    }
}

impl ExecutionContext {
    /// Make sure `ty` is initialized, running its initializer on this
    /// context if nobody has.
    pub fn initialize(&mut self, ty: TypeId) -> KilnResult<()> {
        let desc = self.runtime.table().get(ty)?;
        let action = match desc.init().try_begin(self.id()) {
            InitAction::InProgress => {
                trace!(ty = %desc.name(), context = %self.id(), "waiting for initializer");
                let id = self.id();
                self.blocking(|| desc.init().wait_terminal(id))
            }
            action => action,
        };
        match action {
            InitAction::Ready | InitAction::Recursive => Ok(()),
            InitAction::Failed(err) => Err(err),
            InitAction::Run => self.run_initialization(&desc),
            InitAction::InProgress => Err(KilnError::internal(format!(
                "initialization of {} still in progress after wait",
                desc.name()
            ))),
        }
    }

    fn run_initialization(&mut self, desc: &Arc<TypeDescriptor>) -> KilnResult<()> {
        match self.initialization_steps(desc) {
            Ok(()) => {
                desc.init()
                    .complete(self.id())
                    .map_err(|err| self.runtime.report_fatal(err))?;
                debug!(ty = %desc.name(), "type initialized");
                self.runtime.events().class_initialized(desc.id(), desc.name());
                Ok(())
            }
            Err(cause) => {
                let err = if cause.is_fatal() {
                    cause
                } else {
                    KilnError::Initialization {
                        type_name: desc.name().clone(),
                        cause: Arc::new(cause),
                    }
                };
                desc.init()
                    .fail(self.id(), err.clone())
                    .map_err(|err| self.runtime.report_fatal(err))?;
                debug!(ty = %desc.name(), %err, "type initialization failed");
                self.runtime.events().class_init_failed(desc.id(), desc.name(), &err);
                Err(err)
            }
        }
    }

    fn initialization_steps(&mut self, desc: &TypeDescriptor) -> KilnResult<()> {
        if let Some(superclass) = desc.superclass() {
            self.initialize(superclass)?;
        }
        desc.statics().assign_initial(&desc.definition().static_fields);
        if let Some(clinit) = desc.clinit().cloned() {
            self.invoke_method(clinit, &[])?;
        }
        Ok(())
    }
}
