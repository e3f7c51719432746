// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! The generic calling convention: a stack of tagged values.
//!
//! Boxed kernels receive their arguments through a [`Stack`] and leave the
//! result on top of it (a unit result is pushed as [`Value::Unit`], never
//! omitted). Statically typed kernels never touch a stack on the fast path;
//! the marshalling here only runs when a typed call has to cross into a
//! boxed kernel or vice versa.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{DispatchError, DispatchResult};
use crate::schema::TypeKind;

/// Opaque payload handle. The tensor layer wraps its tensors in a
/// `TensorRef` before they enter the dispatcher; this subsystem never looks
/// inside.
#[derive(Clone)]
pub struct TensorRef(Arc<dyn Any + Send + Sync>);

impl TensorRef {
    pub fn new<T: Any + Send + Sync>(payload: T) -> TensorRef {
        TensorRef(Arc::new(payload))
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TensorRef(..)")
    }
}

/// One slot of the generic calling convention.
#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(TensorRef),
}

impl Value {
    pub fn kind(&self) -> TypeKind {
        match self {
            Value::Unit => TypeKind::Unit,
            Value::Bool(_) => TypeKind::Bool,
            Value::Int(_) => TypeKind::Int,
            Value::Float(_) => TypeKind::Float,
            Value::Str(_) => TypeKind::Str,
            Value::Tensor(_) => TypeKind::Tensor,
        }
    }
}

pub type Stack = Vec<Value>;

fn mismatch(expected: TypeKind, got: &Value) -> DispatchError {
    DispatchError::TypeMismatch {
        expected: expected.name(),
        got: got.kind().name().to_string(),
    }
}

/// A Rust type that can cross the generic calling convention.
pub trait IntoValue: Send + Sized + 'static {
    const KIND: TypeKind;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> DispatchResult<Self>;
}

impl IntoValue for () {
    const KIND: TypeKind = TypeKind::Unit;
    fn into_value(self) -> Value {
        Value::Unit
    }
    fn from_value(value: Value) -> DispatchResult<()> {
        match value {
            Value::Unit => Ok(()),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl IntoValue for bool {
    const KIND: TypeKind = TypeKind::Bool;
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
    fn from_value(value: Value) -> DispatchResult<bool> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl IntoValue for i64 {
    const KIND: TypeKind = TypeKind::Int;
    fn into_value(self) -> Value {
        Value::Int(self)
    }
    fn from_value(value: Value) -> DispatchResult<i64> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl IntoValue for f64 {
    const KIND: TypeKind = TypeKind::Float;
    fn into_value(self) -> Value {
        Value::Float(self)
    }
    fn from_value(value: Value) -> DispatchResult<f64> {
        match value {
            Value::Float(v) => Ok(v),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl IntoValue for String {
    const KIND: TypeKind = TypeKind::Str;
    fn into_value(self) -> Value {
        Value::Str(self)
    }
    fn from_value(value: Value) -> DispatchResult<String> {
        match value {
            Value::Str(v) => Ok(v),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl IntoValue for TensorRef {
    const KIND: TypeKind = TypeKind::Tensor;
    fn into_value(self) -> Value {
        Value::Tensor(self)
    }
    fn from_value(value: Value) -> DispatchResult<TensorRef> {
        match value {
            Value::Tensor(v) => Ok(v),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

/// An argument tuple of the typed calling convention. Arguments are pushed
/// in declaration order, so the last argument sits on top of the stack.
pub trait KernelTuple: Send + Sized + 'static {
    const ARITY: usize;
    fn type_kinds() -> Vec<TypeKind>;
    fn push_onto(self, stack: &mut Stack);
    fn pop_from(stack: &mut Stack) -> DispatchResult<Self>;
}

macro_rules! impl_kernel_tuple {
    ($count:expr $(, $ty:ident)*) => {
        impl<$($ty: IntoValue),*> KernelTuple for ($($ty,)*) {
            const ARITY: usize = $count;

            fn type_kinds() -> Vec<TypeKind> {
                vec![$($ty::KIND),*]
            }

            #[allow(non_snake_case)]
            fn push_onto(self, stack: &mut Stack) {
                let ($($ty,)*) = self;
                $(stack.push($ty.into_value());)*
                let _ = stack;
            }

            #[allow(unused_variables, unused_mut)]
            fn pop_from(stack: &mut Stack) -> DispatchResult<Self> {
                let base = stack
                    .len()
                    .checked_sub($count)
                    .ok_or(DispatchError::StackUnderflow {
                        needed: $count,
                        have: stack.len(),
                    })?;
                let mut taken = stack.drain(base..);
                Ok(($(
                    // Length was checked above; drain yields in push order.
                    $ty::from_value(taken.next().expect("stack length checked"))?,
                )*))
            }
        }
    };
}

impl_kernel_tuple!(0);
impl_kernel_tuple!(1, A0);
impl_kernel_tuple!(2, A0, A1);
impl_kernel_tuple!(3, A0, A1, A2);
impl_kernel_tuple!(4, A0, A1, A2, A3);
impl_kernel_tuple!(5, A0, A1, A2, A3, A4);
impl_kernel_tuple!(6, A0, A1, A2, A3, A4, A5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_travel_in_declaration_order() {
        let mut stack = Stack::new();
        (1i64, 2.5f64, "x".to_string()).push_onto(&mut stack);
        assert_eq!(stack.len(), 3);
        let (a, b, c) = <(i64, f64, String)>::pop_from(&mut stack).unwrap();
        assert_eq!((a, b, c.as_str()), (1, 2.5, "x"));
        assert!(stack.is_empty());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut stack = vec![Value::Int(7)];
        let err = <(f64,)>::pop_from(&mut stack).unwrap_err();
        assert!(matches!(err, DispatchError::TypeMismatch { .. }));
    }

    #[test]
    fn underflow_is_reported() {
        let mut stack = Stack::new();
        let err = <(i64, i64)>::pop_from(&mut stack).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::StackUnderflow { needed: 2, have: 0 }
        ));
    }

    #[test]
    fn tensor_refs_round_trip_by_identity() {
        let t = TensorRef::new(vec![1.0f32, 2.0]);
        let v = t.clone().into_value();
        let back = TensorRef::from_value(v).unwrap();
        assert_eq!(back.downcast::<Vec<f32>>().unwrap(), &vec![1.0f32, 2.0]);
    }
}
