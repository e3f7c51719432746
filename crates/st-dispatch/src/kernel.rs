// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Kernel handles: one registered implementation, callable through either
//! calling convention.
//!
//! A [`KernelFunction`] can be built from a boxed implementation (a closure
//! over the generic value stack) or from a statically typed function. Each
//! form can be invoked through the other: a typed call into a boxed kernel
//! marshals its arguments through the stack, and a boxed call into a typed
//! kernel goes through a generic wrapper that is synthesised on first use
//! and published exactly once, so racing first calls are safe.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use st_keys::KeySet;

use crate::dispatch::OperatorHandle;
use crate::error::{DispatchError, DispatchResult};
use crate::schema::FunctionSchema;
use crate::value::{IntoValue, KernelTuple, Stack};

/// The boxed calling convention: arguments on the stack in declaration
/// order, result pushed on return (unit results push [`crate::Value::Unit`]).
pub type BoxedKernel =
    Arc<dyn Fn(&OperatorHandle, KeySet, &mut Stack) -> DispatchResult<()> + Send + Sync>;

/// Identity of a typed kernel's Rust call shape. Two kernels registered to
/// one operator must agree on this, otherwise a later typed call site would
/// silently misinterpret its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSignature {
    id: TypeId,
    name: &'static str,
}

impl CallSignature {
    pub fn of<A: KernelTuple, R: IntoValue>() -> CallSignature {
        CallSignature {
            id: TypeId::of::<fn(A) -> R>(),
            name: std::any::type_name::<fn(A) -> R>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for CallSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// Monomorphized storage for a typed kernel; recovered by downcast in
// `call`, which is what makes the unboxed fast path signature-safe.
struct Typed<A, R> {
    f: Box<dyn Fn(A) -> R + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    None,
    /// Performs no work; tells the dispatcher to defer to the
    /// next-lower-priority applicable key.
    Fallthrough,
    /// Registered to a catch-all autograd slot whose resolution is
    /// ambiguous; invoking it is an error naming the fix.
    AmbiguousAutogradOther,
}

/// A calling-convention-agnostic kernel wrapper.
#[derive(Clone)]
pub struct KernelFunction {
    boxed: Option<BoxedKernel>,
    unboxed: Option<Arc<dyn Any + Send + Sync>>,
    // Builds the generic wrapper for `unboxed`; created while the concrete
    // types are still known.
    boxed_from_unboxed: Option<Arc<dyn Fn() -> BoxedKernel + Send + Sync>>,
    // Shared across clones so one synthesis serves every copy in the
    // dispatch table.
    synthesized: Arc<OnceCell<BoxedKernel>>,
    signature: Option<CallSignature>,
    inferred_schema: Option<FunctionSchema>,
    marker: Marker,
}

impl KernelFunction {
    fn empty(marker: Marker) -> KernelFunction {
        KernelFunction {
            boxed: None,
            unboxed: None,
            boxed_from_unboxed: None,
            synthesized: Arc::new(OnceCell::new()),
            signature: None,
            inferred_schema: None,
            marker,
        }
    }

    /// A kernel implemented against the generic calling convention.
    pub fn from_boxed<F>(f: F) -> KernelFunction
    where
        F: Fn(&OperatorHandle, KeySet, &mut Stack) -> DispatchResult<()> + Send + Sync + 'static,
    {
        KernelFunction {
            boxed: Some(Arc::new(f)),
            ..KernelFunction::empty(Marker::None)
        }
    }

    /// A statically typed kernel. Captures the call signature and the
    /// inferred schema for registration-time cross-checks.
    pub fn from_typed<A, R, F>(f: F) -> KernelFunction
    where
        A: KernelTuple,
        R: IntoValue,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let typed: Arc<Typed<A, R>> = Arc::new(Typed { f: Box::new(f) });
        let for_wrapper = Arc::clone(&typed);
        let factory: Arc<dyn Fn() -> BoxedKernel + Send + Sync> = Arc::new(move || {
            let typed = Arc::clone(&for_wrapper);
            Arc::new(move |_op: &OperatorHandle, _keys: KeySet, stack: &mut Stack| {
                let args = A::pop_from(stack)?;
                let ret = (typed.f)(args);
                stack.push(ret.into_value());
                Ok(())
            })
        });
        KernelFunction {
            unboxed: Some(typed as Arc<dyn Any + Send + Sync>),
            boxed_from_unboxed: Some(factory),
            signature: Some(CallSignature::of::<A, R>()),
            inferred_schema: Some(FunctionSchema::infer::<A, R>()),
            ..KernelFunction::empty(Marker::None)
        }
    }

    /// The reserved do-nothing kernel that defers to the next applicable key.
    pub fn fallthrough() -> KernelFunction {
        KernelFunction::empty(Marker::Fallthrough)
    }

    /// The marker installed when catch-all autograd resolution is ambiguous.
    pub fn ambiguous_autograd_other() -> KernelFunction {
        KernelFunction::empty(Marker::AmbiguousAutogradOther)
    }

    /// The invalid kernel; dispatching to it is a missing-kernel error.
    pub fn missing() -> KernelFunction {
        KernelFunction::empty(Marker::None)
    }

    pub fn is_valid(&self) -> bool {
        self.boxed.is_some() || self.unboxed.is_some() || self.marker != Marker::None
    }

    pub fn is_valid_unboxed(&self) -> bool {
        self.unboxed.is_some()
    }

    pub fn is_fallthrough(&self) -> bool {
        self.marker == Marker::Fallthrough
    }

    pub fn is_ambiguous(&self) -> bool {
        self.marker == Marker::AmbiguousAutogradOther
    }

    pub(crate) fn signature(&self) -> Option<CallSignature> {
        self.signature
    }

    pub(crate) fn inferred_schema(&self) -> Option<&FunctionSchema> {
        self.inferred_schema.as_ref()
    }

    /// Calls through the typed convention. Uses the unboxed form directly
    /// when its monomorphization matches `A`/`R`, otherwise marshals the
    /// arguments through the boxed form.
    pub fn call<A, R>(&self, op: &OperatorHandle, keys: KeySet, args: A) -> DispatchResult<R>
    where
        A: KernelTuple,
        R: IntoValue,
    {
        if let Some(unboxed) = &self.unboxed {
            if let Some(typed) = unboxed.downcast_ref::<Typed<A, R>>() {
                return Ok((typed.f)(args));
            }
            if self.boxed.is_none() {
                let expected = match self.signature {
                    Some(sig) => sig.name().to_string(),
                    None => "(unknown)".to_string(),
                };
                return Err(DispatchError::SignatureMismatch {
                    operator: op.name().to_string(),
                    expected,
                    expected_debug: "registered kernel".to_string(),
                    seen: CallSignature::of::<A, R>().name().to_string(),
                    seen_debug: "typed call site".to_string(),
                });
            }
        }
        let mut stack = Stack::with_capacity(A::ARITY.max(1));
        args.push_onto(&mut stack);
        self.call_boxed(op, keys, &mut stack)?;
        let ret = stack.pop().ok_or(DispatchError::StackUnderflow {
            needed: 1,
            have: 0,
        })?;
        R::from_value(ret)
    }

    /// Calls through the boxed convention, synthesising the generic wrapper
    /// from the typed form on first use.
    pub fn call_boxed(
        &self,
        op: &OperatorHandle,
        keys: KeySet,
        stack: &mut Stack,
    ) -> DispatchResult<()> {
        match self.marker {
            Marker::Fallthrough => {
                return Err(DispatchError::InconsistentState {
                    operator: op.name().to_string(),
                    reason: "fallthrough kernel invoked through the calling convention"
                        .to_string(),
                })
            }
            Marker::AmbiguousAutogradOther => {
                return Err(DispatchError::AmbiguousAutogradOther {
                    operator: op.name().to_string(),
                    key: keys.highest_priority_key(),
                })
            }
            Marker::None => {}
        }
        if let Some(boxed) = &self.boxed {
            return boxed(op, keys, stack);
        }
        if let Some(factory) = &self.boxed_from_unboxed {
            let wrapper = self.synthesized.get_or_init(|| factory());
            return wrapper(op, keys, stack);
        }
        Err(DispatchError::InconsistentState {
            operator: op.name().to_string(),
            reason: "invalid kernel reached the calling convention".to_string(),
        })
    }

    /// Pointer-level identity across both calling conventions; what the
    /// registry's consistency check compares, since closures have no
    /// meaningful structural equality.
    pub fn same_identity(&self, other: &KernelFunction) -> bool {
        fn same<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
            match (a, b) {
                (Some(x), Some(y)) => Arc::ptr_eq(x, y),
                (None, None) => true,
                _ => false,
            }
        }
        self.marker == other.marker
            && same(&self.boxed, &other.boxed)
            && same(&self.unboxed, &other.unboxed)
    }

    pub fn dump_state(&self) -> String {
        match self.marker {
            Marker::Fallthrough => "fallthrough".to_string(),
            Marker::AmbiguousAutogradOther => "ambiguous_autogradother".to_string(),
            Marker::None => {
                let mut parts = Vec::new();
                if self.boxed.is_some() {
                    parts.push("boxed");
                }
                if self.unboxed.is_some() {
                    parts.push("unboxed");
                }
                if parts.is_empty() {
                    "invalid".to_string()
                } else {
                    parts.join("+")
                }
            }
        }
    }
}

impl fmt::Debug for KernelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelFunction({})", self.dump_state())
    }
}

/// A registered kernel plus its registration-time metadata: the schema
/// inferred from its static signature (if any) and a debug label recording
/// where the registration came from.
#[derive(Debug, Clone)]
pub struct AnnotatedKernel {
    pub kernel: KernelFunction,
    pub inferred_schema: Option<FunctionSchema>,
    pub debug: String,
}

impl AnnotatedKernel {
    pub fn new(kernel: KernelFunction, debug: String) -> AnnotatedKernel {
        let inferred_schema = kernel.inferred_schema().cloned();
        AnnotatedKernel {
            kernel,
            inferred_schema,
            debug,
        }
    }
}
