// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! The dispatcher: the directory of operator entries plus the process-wide
//! backend fallbacks.
//!
//! There is deliberately no global singleton here: a [`Dispatcher`] is
//! constructed once at process start, threaded explicitly through
//! registration and invocation, entries are created lazily on first
//! reference and torn down when their last registration is removed.

use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use st_keys::{BackendComponent, DispatchKey, Functionality, KeySet};

use super::entry::{KernelToken, OperatorEntry, TableEntry};
use crate::error::{DispatchError, DispatchResult};
use crate::kernel::{AnnotatedKernel, CallSignature, KernelFunction};
use crate::schema::FunctionSchema;
use crate::value::{IntoValue, KernelTuple, Stack};

/// One process-wide fallback kernel slot per backend, consulted by rule 6
/// of the table computation for any operator lacking a more specific
/// kernel on that backend's column.
pub(crate) struct FallbackTable {
    slots: Vec<RwLock<Option<AnnotatedKernel>>>,
}

impl FallbackTable {
    fn new() -> FallbackTable {
        FallbackTable {
            slots: (0..BackendComponent::COUNT)
                .map(|_| RwLock::new(None))
                .collect(),
        }
    }

    pub(crate) fn get(&self, backend: BackendComponent) -> Option<AnnotatedKernel> {
        self.slots[backend as usize].read().unwrap().clone()
    }
}

/// A cheap, clonable reference to one operator's registry entry. Handles
/// keep the entry alive even after it is pruned from the directory.
#[derive(Clone)]
pub struct OperatorHandle {
    entry: Arc<OperatorEntry>,
}

impl OperatorHandle {
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Validates `A`/`R` against the operator's recorded kernel signature
    /// once, yielding a handle whose calls skip that check.
    pub fn typed<A, R>(&self) -> DispatchResult<TypedOperatorHandle<A, R>>
    where
        A: KernelTuple,
        R: IntoValue,
    {
        self.entry.validate_signature(CallSignature::of::<A, R>())?;
        Ok(TypedOperatorHandle {
            op: self.clone(),
            _signature: PhantomData,
        })
    }
}

impl std::fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperatorHandle({})", self.name())
    }
}

/// An operator handle locked to one static call signature.
pub struct TypedOperatorHandle<A, R> {
    op: OperatorHandle,
    _signature: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for TypedOperatorHandle<A, R> {
    fn clone(&self) -> Self {
        TypedOperatorHandle {
            op: self.op.clone(),
            _signature: PhantomData,
        }
    }
}

impl<A, R> std::fmt::Debug for TypedOperatorHandle<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypedOperatorHandle({})", self.op.name())
    }
}

impl<A: KernelTuple, R: IntoValue> TypedOperatorHandle<A, R> {
    pub fn call(&self, dispatcher: &Dispatcher, keys: KeySet, args: A) -> DispatchResult<R> {
        dispatcher.call_typed(&self.op, keys, args)
    }

    pub fn operator(&self) -> &OperatorHandle {
        &self.op
    }
}

/// The operator directory and fallback registry.
pub struct Dispatcher {
    entries: RwLock<FxHashMap<String, Arc<OperatorEntry>>>,
    fallbacks: FallbackTable,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            entries: RwLock::new(FxHashMap::default()),
            fallbacks: FallbackTable::new(),
        }
    }

    /// Fetches the entry for `name`, creating it on first reference. A
    /// fresh entry derives its full dispatch table immediately so it picks
    /// up fallbacks registered before the operator existed.
    pub fn declare(&self, name: &str) -> OperatorHandle {
        if let Some(entry) = self.entries.read().unwrap().get(name) {
            return OperatorHandle {
                entry: Arc::clone(entry),
            };
        }
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OperatorEntry::new(name.to_string(), &self.fallbacks)));
        OperatorHandle {
            entry: Arc::clone(entry),
        }
    }

    pub fn find(&self, name: &str) -> Option<OperatorHandle> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|entry| OperatorHandle {
                entry: Arc::clone(entry),
            })
    }

    /// Names of every operator currently in the directory.
    pub fn operators(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn register_schema(
        &self,
        op: &OperatorHandle,
        schema: &str,
        debug: &str,
    ) -> DispatchResult<()> {
        let schema: FunctionSchema = schema.parse()?;
        op.entry.register_schema(schema, debug.to_string())?;
        tracing::debug!(operator = %op.name(), "registered schema");
        Ok(())
    }

    pub fn deregister_schema(&self, op: &OperatorHandle) -> DispatchResult<()> {
        op.entry.deregister_schema()?;
        self.prune(op);
        Ok(())
    }

    /// Registers `kernel` for `key` (or the catch-all when `key` is
    /// `None`), returning the token needed to deregister it again.
    pub fn register_kernel(
        &self,
        op: &OperatorHandle,
        key: Option<DispatchKey>,
        kernel: KernelFunction,
        debug: &str,
    ) -> DispatchResult<KernelToken> {
        let token = op
            .entry
            .register_kernel(&self.fallbacks, key, kernel, debug.to_string())?;
        let debug_str = debug;
        tracing::debug!(
            operator = %op.name(),
            key = %key.map(|k| k.to_string()).unwrap_or_else(|| "(catch all)".to_string()),
            debug = %debug_str,
            "registered kernel"
        );
        Ok(token)
    }

    pub fn deregister_kernel(
        &self,
        op: &OperatorHandle,
        key: Option<DispatchKey>,
        token: KernelToken,
    ) -> DispatchResult<()> {
        op.entry.deregister_kernel(&self.fallbacks, key, token)?;
        tracing::debug!(
            operator = %op.name(),
            key = %key.map(|k| k.to_string()).unwrap_or_else(|| "(catch all)".to_string()),
            "deregistered kernel"
        );
        self.prune(op);
        Ok(())
    }

    /// Registers the process-wide fallback for one backend and rebuilds the
    /// affected column of every entry's table.
    pub fn register_backend_fallback(
        &self,
        backend: BackendComponent,
        kernel: KernelFunction,
        debug: &str,
    ) -> DispatchResult<()> {
        if !kernel.is_valid() {
            return Err(DispatchError::InvalidRegistration {
                operator: format!("(fallback for {backend})"),
                reason: "kernel has neither a boxed nor an unboxed implementation".to_string(),
            });
        }
        {
            let mut slot = self.fallbacks.slots[backend as usize].write().unwrap();
            if slot.is_some() {
                return Err(DispatchError::InvalidRegistration {
                    operator: format!("(fallback for {backend})"),
                    reason: "a fallback kernel is already registered for this backend"
                        .to_string(),
                });
            }
            *slot = Some(AnnotatedKernel::new(kernel, debug.to_string()));
        }
        self.broadcast_fallback(backend);
        Ok(())
    }

    pub fn deregister_backend_fallback(&self, backend: BackendComponent) -> DispatchResult<()> {
        {
            let mut slot = self.fallbacks.slots[backend as usize].write().unwrap();
            if slot.is_none() {
                return Err(DispatchError::InvalidRegistration {
                    operator: format!("(fallback for {backend})"),
                    reason: "no fallback kernel is registered for this backend".to_string(),
                });
            }
            *slot = None;
        }
        self.broadcast_fallback(backend);
        Ok(())
    }

    fn broadcast_fallback(&self, backend: BackendComponent) {
        let entries = self.entries.read().unwrap();
        for entry in entries.values() {
            for functionality in Functionality::PER_BACKEND {
                entry.update_fallback(
                    &self.fallbacks,
                    DispatchKey::Backend(functionality, backend),
                );
            }
        }
    }

    // Drops the directory entry once it holds nothing; outstanding handles
    // keep the Arc alive but the name is free again.
    fn prune(&self, op: &OperatorHandle) {
        if op.entry.is_unused() {
            self.entries.write().unwrap().remove(op.name());
        }
    }

    // Walks the precomputed table from the context's highest-priority key,
    // stepping past fallthrough slots by masking their functionality out of
    // the key set. Returns the masked set alongside the winning slot so
    // kernels can redispatch without re-deriving it.
    fn resolve(
        &self,
        op: &OperatorHandle,
        keys: KeySet,
    ) -> DispatchResult<(KeySet, Arc<TableEntry>)> {
        let mut remaining = keys;
        loop {
            let key = remaining.highest_priority_key();
            let slot = op.entry.lookup(key);
            if slot.provenance == super::entry::KernelProvenance::Missing {
                return Err(op.entry.report_error(&self.fallbacks, key));
            }
            if slot.kernel.kernel.is_ambiguous() {
                return Err(DispatchError::AmbiguousAutogradOther {
                    operator: op.name().to_string(),
                    key,
                });
            }
            if slot.kernel.kernel.is_fallthrough() {
                if key == DispatchKey::Undefined {
                    // Nothing left to fall through to.
                    return Err(op.entry.report_error(&self.fallbacks, key));
                }
                remaining = remaining.remove(key);
                continue;
            }
            return Ok((remaining, slot));
        }
    }

    /// Dispatches through the typed calling convention.
    pub fn call_typed<A, R>(
        &self,
        op: &OperatorHandle,
        keys: KeySet,
        args: A,
    ) -> DispatchResult<R>
    where
        A: KernelTuple,
        R: IntoValue,
    {
        let (masked, slot) = self.resolve(op, keys)?;
        slot.kernel.kernel.call(op, masked, args)
    }

    /// Dispatches through the boxed calling convention; the stack is
    /// updated in place.
    pub fn call_boxed(
        &self,
        op: &OperatorHandle,
        keys: KeySet,
        stack: &mut Stack,
    ) -> DispatchResult<()> {
        let (masked, slot) = self.resolve(op, keys)?;
        slot.kernel.kernel.call_boxed(op, masked, stack)
    }

    /// The live dispatch-table slot for `key`, as invocation would see it.
    pub fn table_entry(&self, op: &OperatorHandle, key: DispatchKey) -> TableEntry {
        (*op.entry.lookup(key)).clone()
    }

    pub fn dump_registered_state(&self, op: &OperatorHandle) -> String {
        op.entry.dump_state()
    }

    pub fn dump_computed_table(&self, op: &OperatorHandle) -> String {
        op.entry.dump_computed_table(&self.fallbacks)
    }

    pub fn list_active_keys(&self, op: &OperatorHandle) -> Vec<DispatchKey> {
        op.entry.list_active_keys()
    }

    pub fn check_invariants(&self, op: &OperatorHandle) -> DispatchResult<()> {
        op.entry.check_invariants(&self.fallbacks)
    }
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}
