//! Method handles.
//!
//! A [`Lookup`] carries the class it acts for and checks access once, when
//! a handle is created. The handle stores what it refers to by name and
//! resolves at every call, so handles follow redefinition like call sites
//! do.

use crate::context::ExecutionContext;
use crate::runtime::Runtime;
use kiln_core::{KilnError, KilnResult, Symbol, TypeId, Value};
use kiln_runtime::{ClassTable, MethodVersion};
use std::sync::Arc;

/// Factory for access-checked [`MethodHandle`]s.
#[derive(Debug, Clone)]
pub struct Lookup {
    runtime: Arc<Runtime>,
    lookup_class: TypeId,
}

impl Lookup {
    /// A lookup acting for `lookup_class`.
    pub fn new(runtime: Arc<Runtime>, lookup_class: TypeId) -> Self {
        Self {
            runtime,
            lookup_class,
        }
    }

    /// The class this lookup acts for.
    #[inline]
    pub fn lookup_class(&self) -> TypeId {
        self.lookup_class
    }

    /// Handle dispatching `name` virtually on receivers of `ty`.
    pub fn find_virtual(&self, ty: TypeId, name: &str) -> KilnResult<MethodHandle> {
        let method = self.runtime.table().resolve_virtual(ty, name)?;
        Ok(MethodHandle::new(HandleKind::Virtual, ty, method))
    }

    /// Handle calling `name` non-virtually from `ref_type` upward, on
    /// behalf of `special_caller`.
    ///
    /// `special_caller` must be the lookup class and `ref_type` must be it
    /// or one of its superclasses. A private method is only reachable
    /// from the class declaring it.
    pub fn find_special(
        &self,
        ref_type: TypeId,
        name: &str,
        special_caller: TypeId,
    ) -> KilnResult<MethodHandle> {
        let table = self.runtime.table();
        if special_caller != self.lookup_class {
            return Err(KilnError::illegal_access(format!(
                "{} cannot act as special caller {}",
                self.type_name(self.lookup_class),
                self.type_name(special_caller)
            )));
        }
        if !table.superclass_chain(special_caller).contains(&ref_type) {
            return Err(KilnError::illegal_access(format!(
                "{} is not a superclass of {}",
                self.type_name(ref_type),
                self.type_name(special_caller)
            )));
        }
        let method = table.resolve_special(ref_type, name)?;
        if method.is_private() && method.declaring() != special_caller {
            return Err(KilnError::illegal_access(format!(
                "{}.{name} is private",
                self.type_name(method.declaring())
            )));
        }
        Ok(MethodHandle::new(
            HandleKind::Special {
                caller: special_caller,
            },
            ref_type,
            method,
        ))
    }

    /// Handle to static method `name` visible from `ty`.
    pub fn find_static(&self, ty: TypeId, name: &str) -> KilnResult<MethodHandle> {
        let method = self.runtime.table().resolve_static(ty, name)?;
        Ok(MethodHandle::new(HandleKind::Static, ty, method))
    }

    fn type_name(&self, ty: TypeId) -> Symbol {
        self.runtime
            .table()
            .get(ty)
            .map(|desc| desc.name().clone())
            .unwrap_or_else(|_| ty.to_string().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleKind {
    Virtual,
    Special { caller: TypeId },
    Static,
}

/// A callable reference to a method.
#[derive(Debug, Clone)]
pub struct MethodHandle {
    kind: HandleKind,
    ref_type: TypeId,
    name: Symbol,
    arity: usize,
}

impl MethodHandle {
    fn new(kind: HandleKind, ref_type: TypeId, method: Arc<MethodVersion>) -> Self {
        Self {
            kind,
            ref_type,
            name: method.name().clone(),
            arity: method.arity(),
        }
    }

    /// Method name.
    #[inline]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    /// Number of arguments, receiver included.
    #[inline]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Call the method on `ctx`. For instance handles `args[0]` is the
    /// receiver.
    pub fn invoke(&self, ctx: &mut ExecutionContext, args: &[Value]) -> KilnResult<Value> {
        if args.len() != self.arity {
            return Err(KilnError::wrong_method_type(format!(
                "{} expects {} arguments, got {}",
                self.name,
                self.arity,
                args.len()
            )));
        }
        let runtime = Arc::clone(ctx.runtime());
        let table = runtime.table();
        let method = match self.kind {
            HandleKind::Static => {
                let method = table.resolve_static(self.ref_type, &self.name)?;
                ctx.initialize(method.declaring())?;
                method
            }
            HandleKind::Virtual => {
                let class = ctx.receiver_class(args[0])?;
                self.check_receiver(table, class, self.ref_type)?;
                table.resolve_virtual(class, &self.name)?
            }
            HandleKind::Special { caller } => {
                let class = ctx.receiver_class(args[0])?;
                self.check_receiver(table, class, caller)?;
                table.resolve_special(self.ref_type, &self.name)?
            }
        };
        ctx.invoke_method(method, args)
    }

    fn check_receiver(
        &self,
        table: &ClassTable,
        class: TypeId,
        expected: TypeId,
    ) -> KilnResult<()> {
        if table.is_subtype_of(class, expected) {
            return Ok(());
        }
        let name = |ty: TypeId| {
            table
                .get(ty)
                .map(|desc| desc.name().clone())
                .unwrap_or_else(|_| ty.to_string().into())
        };
        Err(KilnError::wrong_method_type(format!(
            "receiver {} is not a {}",
            name(class),
            name(expected)
        )))
    }
}

impl ExecutionContext {
    /// A [`Lookup`] acting for `lookup_class`.
    pub fn lookup(&self, lookup_class: TypeId) -> Lookup {
        Lookup::new(Arc::clone(&self.runtime), lookup_class)
    }
}
