// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Registration-surface checks: schema and signature cross-validation,
//! invalid targets, catch-all redirection and operator lifecycle.

use st_dispatch::keys::{AliasKey, DispatchKey, Functionality, KeySet};
use st_dispatch::{DispatchError, Dispatcher, KernelFunction, TensorRef, Value};

#[test]
fn schema_is_checked_against_typed_kernels_both_ways() {
    let dispatcher = Dispatcher::new();

    // Declared first, kernel second.
    let op = dispatcher.declare("test::schema_first");
    dispatcher
        .register_schema(&op, "(Tensor, Tensor) -> Tensor", "declared")
        .unwrap();
    let err = dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_typed(|(a,): (i64,)| a),
            "wrong shape",
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::SchemaMismatch { .. }));

    // Kernel first, schema second; the failed declaration must not stick.
    let op = dispatcher.declare("test::kernel_first");
    dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_typed(|(a,): (i64,)| a),
            "int identity",
        )
        .unwrap();
    let err = dispatcher
        .register_schema(&op, "(Tensor) -> Tensor", "wrong declaration")
        .unwrap_err();
    assert!(matches!(err, DispatchError::SchemaMismatch { .. }));
    dispatcher
        .register_schema(&op, "(int) -> int", "right declaration")
        .unwrap();
}

#[test]
fn boxed_kernels_carry_no_inferred_schema() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::boxed_schema");
    dispatcher
        .register_schema(&op, "(Tensor, Tensor) -> Tensor", "declared")
        .unwrap();
    // Nothing to cross-check, so any boxed kernel is accepted.
    dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_boxed(|_op, _keys, stack| {
                stack.clear();
                stack.push(Value::Unit);
                Ok(())
            }),
            "boxed kernel",
        )
        .unwrap();
}

#[test]
fn schema_lifecycle_errors() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::schema_lifecycle");
    dispatcher
        .register_schema(&op, "(int) -> int", "first")
        .unwrap();
    let err = dispatcher
        .register_schema(&op, "(int) -> int", "second")
        .unwrap_err();
    assert!(matches!(err, DispatchError::SchemaAlreadyRegistered { .. }));

    dispatcher.deregister_schema(&op).unwrap();
    // The entry died with its schema; a fresh declaration has none to drop.
    let op = dispatcher.declare("test::schema_lifecycle");
    let err = dispatcher.deregister_schema(&op).unwrap_err();
    assert!(matches!(err, DispatchError::NoSchemaRegistered { .. }));
}

#[test]
fn kernels_must_agree_on_call_signature() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::signatures");
    dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_typed(|(a, b): (i64, i64)| a + b),
            "cpu ints",
        )
        .unwrap();

    let err = dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CUDA),
            KernelFunction::from_typed(|(a, b): (f64, f64)| a + b),
            "cuda floats",
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::SignatureMismatch { .. }));

    // The typed-handle surface performs the same check once up front.
    assert!(op.typed::<(i64, i64), i64>().is_ok());
    let err = op.typed::<(f64, f64), f64>().unwrap_err();
    assert!(matches!(err, DispatchError::SignatureMismatch { .. }));

    let handle = op.typed::<(i64, i64), i64>().unwrap();
    let sum = handle
        .call(&dispatcher, KeySet::of(&[DispatchKey::CPU]), (20, 22))
        .unwrap();
    assert_eq!(sum, 42);
}

#[test]
fn catch_all_registrations_redirect_to_the_implicit_composite() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::catch_all");
    let token = dispatcher
        .register_kernel(
            &op,
            None,
            KernelFunction::from_typed(|(a,): (i64,)| a * 2),
            "catch-all",
        )
        .unwrap();

    let dump = dispatcher.dump_registered_state(&op);
    assert!(
        dump.contains("CompositeImplicitAutograd[alias]: catch-all"),
        "dump = {dump}"
    );

    // The same redirection applies on the way out.
    dispatcher
        .deregister_kernel(
            &op,
            Some(DispatchKey::Alias(AliasKey::CompositeImplicitAutograd)),
            token,
        )
        .unwrap();
    assert!(dispatcher.find("test::catch_all").is_none());
}

#[test]
fn invalid_registration_targets_are_rejected() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::invalid_targets");
    let kernel = || KernelFunction::from_typed(|(a,): (i64,)| a);

    let err = dispatcher
        .register_kernel(&op, Some(DispatchKey::Undefined), kernel(), "undefined")
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRegistration { .. }));

    // Per-backend base markers own no table slot and take no kernels.
    let err = dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::Func(Functionality::Dense)),
            kernel(),
            "base marker",
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRegistration { .. }));

    let err = dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::missing(),
            "invalid kernel",
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRegistration { .. }));
}

#[test]
fn deregistration_requires_a_live_token() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::tokens");
    let token = dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_typed(|(a,): (i64,)| a),
            "cpu",
        )
        .unwrap();

    let err = dispatcher
        .deregister_kernel(&op, Some(DispatchKey::CUDA), token)
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRegistration { .. }));

    dispatcher
        .deregister_kernel(&op, Some(DispatchKey::CPU), token)
        .unwrap();
    // Double deregistration: the key has no kernels left.
    let op = dispatcher.declare("test::tokens");
    let err = dispatcher
        .deregister_kernel(&op, Some(DispatchKey::CPU), token)
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRegistration { .. }));
}

#[test]
fn signatures_outlive_the_kernels_that_recorded_them() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::sticky_signature");
    dispatcher
        .register_schema(&op, "(int) -> int", "keeps the entry alive")
        .unwrap();
    let token = dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_typed(|(a,): (i64,)| a),
            "first kernel",
        )
        .unwrap();
    dispatcher
        .deregister_kernel(&op, Some(DispatchKey::CPU), token)
        .unwrap();

    // The recorded signature still guards new registrations.
    let err = dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_typed(|(a,): (f64,)| a),
            "second kernel",
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::SignatureMismatch { .. }));
}

#[test]
fn generic_stack_calls_update_in_place() {
    let dispatcher = Dispatcher::new();
    let op = dispatcher.declare("test::generic_stack");
    dispatcher
        .register_kernel(
            &op,
            Some(DispatchKey::CPU),
            KernelFunction::from_typed(|(a, b): (TensorRef, TensorRef)| {
                let x = *a.downcast::<i32>().unwrap();
                let y = *b.downcast::<i32>().unwrap();
                TensorRef::new(x + y)
            }),
            "tensor add",
        )
        .unwrap();

    let mut stack = vec![
        Value::Tensor(TensorRef::new(40i32)),
        Value::Tensor(TensorRef::new(2i32)),
    ];
    dispatcher
        .call_boxed(&op, KeySet::of(&[DispatchKey::CPU]), &mut stack)
        .unwrap();
    assert_eq!(stack.len(), 1);
    match &stack[0] {
        Value::Tensor(t) => assert_eq!(*t.downcast::<i32>().unwrap(), 42),
        other => panic!("expected a tensor result, got {other:?}"),
    }
}
