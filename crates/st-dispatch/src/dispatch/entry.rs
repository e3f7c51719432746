// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Per-operator registration state and the dispatch-table computation.
//!
//! An [`OperatorEntry`] owns every kernel registered for one named
//! operation and a fixed table mapping each runtime dispatch key to the
//! currently winning kernel. Registrations mutate the kernel map under a
//! write lock and republish only the affected table slots; invocation reads
//! a slot through an atomic pointer load and never touches the lock, so a
//! concurrent reader always sees some previously published kernel.

use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use st_keys::{AliasKey, DispatchKey, KeySet, NUM_RUNTIME_ENTRIES};

use super::dispatcher::FallbackTable;
use crate::error::{DispatchError, DispatchResult};
use crate::kernel::{AnnotatedKernel, CallSignature, KernelFunction};
use crate::schema::FunctionSchema;

/// Opaque identity of one kernel registration; required to deregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelToken(u64);

/// How a dispatch-table slot got its kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelProvenance {
    DirectKernel,
    DefaultBackendKernel,
    CompositeKernel,
    AutogradKernel,
    Ambiguous,
    BackendFallback,
    Missing,
}

impl std::fmt::Display for KernelProvenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            KernelProvenance::DirectKernel => "direct kernel",
            KernelProvenance::DefaultBackendKernel => "default-backend kernel",
            KernelProvenance::CompositeKernel => "composite kernel",
            KernelProvenance::AutogradKernel => "autograd kernel",
            KernelProvenance::Ambiguous => "ambiguous",
            KernelProvenance::BackendFallback => "backend fallback",
            KernelProvenance::Missing => "missing",
        };
        f.write_str(text)
    }
}

/// One published dispatch-table slot.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub kernel: AnnotatedKernel,
    pub provenance: KernelProvenance,
}

static MISSING: Lazy<Arc<TableEntry>> = Lazy::new(|| {
    Arc::new(TableEntry {
        kernel: AnnotatedKernel::new(KernelFunction::missing(), "missing".to_string()),
        provenance: KernelProvenance::Missing,
    })
});

static AMBIGUOUS: Lazy<AnnotatedKernel> = Lazy::new(|| {
    AnnotatedKernel::new(
        KernelFunction::ambiguous_autograd_other(),
        "ambiguous_autogradother".to_string(),
    )
});

struct KernelRecord {
    token: KernelToken,
    kernel: AnnotatedKernel,
}

struct AnnotatedSchema {
    schema: FunctionSchema,
    debug: String,
}

struct SignatureWithDebug {
    signature: CallSignature,
    debug: String,
}

struct EntryState {
    schema: Option<AnnotatedSchema>,
    // Front of each list is the active kernel; the rest is shadowed
    // history, restored on deregistration. Lists are never empty.
    kernels: FxHashMap<DispatchKey, Vec<KernelRecord>>,
    // Survives its originating kernel so a later registration with a
    // different shape is still rejected while typed handles remain live.
    signature: Option<SignatureWithDebug>,
    next_token: u64,
}

impl Default for EntryState {
    fn default() -> EntryState {
        EntryState {
            schema: None,
            kernels: FxHashMap::default(),
            signature: None,
            next_token: 0,
        }
    }
}

/// Registration state and dispatch table for one named operation.
pub struct OperatorEntry {
    name: String,
    state: RwLock<EntryState>,
    table: Vec<ArcSwap<TableEntry>>,
}

fn check_schema(
    operator: &str,
    declared: &FunctionSchema,
    declared_debug: &str,
    inferred: &FunctionSchema,
    inferred_debug: &str,
) -> DispatchResult<()> {
    if let Some(reason) = declared.difference(inferred) {
        return Err(DispatchError::SchemaMismatch {
            operator: operator.to_string(),
            declared: declared.to_string(),
            declared_debug: declared_debug.to_string(),
            inferred: inferred.to_string(),
            inferred_debug: inferred_debug.to_string(),
            reason,
        });
    }
    Ok(())
}

impl OperatorEntry {
    /// Builds an entry and derives its full table, picking up any backend
    /// fallbacks registered before the operator was first referenced.
    pub(crate) fn new(name: String, fallbacks: &FallbackTable) -> OperatorEntry {
        let table = (0..NUM_RUNTIME_ENTRIES)
            .map(|_| ArcSwap::from(Arc::clone(&MISSING)))
            .collect();
        let entry = OperatorEntry {
            name,
            state: RwLock::new(EntryState::default()),
            table,
        };
        {
            let state = entry.state.read().unwrap();
            entry.update_full(&state, fallbacks);
        }
        entry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn register_schema(
        &self,
        schema: FunctionSchema,
        debug: String,
    ) -> DispatchResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = &state.schema {
            return Err(DispatchError::SchemaAlreadyRegistered {
                operator: self.name.clone(),
                schema: existing.schema.to_string(),
            });
        }
        // Every check happens before the schema is published.
        for records in state.kernels.values() {
            for record in records {
                if let Some(inferred) = &record.kernel.inferred_schema {
                    check_schema(&self.name, &schema, &debug, inferred, &record.kernel.debug)?;
                }
            }
        }
        state.schema = Some(AnnotatedSchema { schema, debug });
        Ok(())
    }

    pub(crate) fn deregister_schema(&self) -> DispatchResult<()> {
        let mut state = self.state.write().unwrap();
        if state.schema.is_none() {
            return Err(DispatchError::NoSchemaRegistered {
                operator: self.name.clone(),
            });
        }
        state.schema = None;
        Ok(())
    }

    pub fn schema(&self) -> Option<FunctionSchema> {
        self.state
            .read()
            .unwrap()
            .schema
            .as_ref()
            .map(|s| s.schema.clone())
    }

    pub(crate) fn register_kernel(
        &self,
        fallbacks: &FallbackTable,
        key: Option<DispatchKey>,
        kernel: KernelFunction,
        debug: String,
    ) -> DispatchResult<KernelToken> {
        // Catch-all registrations target the implicit composite key.
        let target = match key {
            None => DispatchKey::Alias(AliasKey::CompositeImplicitAutograd),
            Some(k) => {
                if k == DispatchKey::Undefined || (!k.is_runtime() && !k.is_alias()) {
                    return Err(DispatchError::InvalidRegistration {
                        operator: self.name.clone(),
                        reason: format!("kernels cannot be registered to {k}"),
                    });
                }
                k
            }
        };
        if !kernel.is_valid() {
            return Err(DispatchError::InvalidRegistration {
                operator: self.name.clone(),
                reason: "kernel has neither a boxed nor an unboxed implementation".to_string(),
            });
        }

        let mut state = self.state.write().unwrap();

        if let Some(signature) = kernel.signature() {
            match &state.signature {
                Some(existing) if existing.signature != signature => {
                    return Err(DispatchError::SignatureMismatch {
                        operator: self.name.clone(),
                        expected: existing.signature.name().to_string(),
                        expected_debug: existing.debug.clone(),
                        seen: signature.name().to_string(),
                        seen_debug: debug.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    state.signature = Some(SignatureWithDebug {
                        signature,
                        debug: debug.clone(),
                    });
                }
            }
        }

        if let (Some(declared), Some(inferred)) = (&state.schema, kernel.inferred_schema()) {
            check_schema(
                &self.name,
                &declared.schema,
                &declared.debug,
                inferred,
                &debug,
            )?;
        }

        let token = KernelToken(state.next_token);
        state.next_token += 1;

        let records = state.kernels.entry(target).or_default();
        if !records.is_empty() && spiral_config::dispatch::config().warn_on_override {
            let debug_str = &debug;
            tracing::warn!(
                operator = %self.name,
                key = %target,
                previous = %records[0].kernel.debug,
                new = %debug_str,
                "overriding a previously registered kernel for the same operator \
                 and dispatch key"
            );
        }
        records.insert(
            0,
            KernelRecord {
                token,
                kernel: AnnotatedKernel::new(kernel, debug),
            },
        );

        if key.is_some() {
            self.update_for_key(&state, fallbacks, target);
        } else {
            self.update_full(&state, fallbacks);
        }
        if spiral_config::dispatch::config().paranoid_checks {
            self.check_invariants_locked(&state, fallbacks)?;
        }
        Ok(token)
    }

    pub(crate) fn deregister_kernel(
        &self,
        fallbacks: &FallbackTable,
        key: Option<DispatchKey>,
        token: KernelToken,
    ) -> DispatchResult<()> {
        let target = match key {
            None => DispatchKey::Alias(AliasKey::CompositeImplicitAutograd),
            Some(k) => k,
        };
        let mut state = self.state.write().unwrap();
        let records = state.kernels.get_mut(&target).ok_or_else(|| {
            DispatchError::InvalidRegistration {
                operator: self.name.clone(),
                reason: format!("no kernels are registered for dispatch key {target}"),
            }
        })?;
        let position = records
            .iter()
            .position(|r| r.token == token)
            .ok_or_else(|| DispatchError::InvalidRegistration {
                operator: self.name.clone(),
                reason: format!("no kernel with the given token under {target}"),
            })?;
        records.remove(position);
        if records.is_empty() {
            // Empty lists are not a valid state; drop the key entirely.
            state.kernels.remove(&target);
        }
        self.update_for_key(&state, fallbacks, target);
        if spiral_config::dispatch::config().paranoid_checks {
            self.check_invariants_locked(&state, fallbacks)?;
        }
        Ok(())
    }

    /// Reacts to a process-wide backend-fallback change.
    pub(crate) fn update_fallback(&self, fallbacks: &FallbackTable, key: DispatchKey) {
        let state = self.state.read().unwrap();
        self.update_for_key(&state, fallbacks, key);
    }

    pub(crate) fn validate_signature(&self, signature: CallSignature) -> DispatchResult<()> {
        let state = self.state.read().unwrap();
        if let Some(existing) = &state.signature {
            if existing.signature != signature {
                return Err(DispatchError::SignatureMismatch {
                    operator: self.name.clone(),
                    expected: existing.signature.name().to_string(),
                    expected_debug: existing.debug.clone(),
                    seen: signature.name().to_string(),
                    seen_debug: "typed operator handle".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The active kernel directly registered to `key`, ignoring aliases and
    /// fallbacks.
    pub fn kernel_for(&self, key: DispatchKey) -> Option<AnnotatedKernel> {
        let state = self.state.read().unwrap();
        state
            .kernels
            .get(&key)
            .and_then(|records| records.first())
            .map(|record| record.kernel.clone())
    }

    pub fn has_kernel_for(&self, key: DispatchKey) -> bool {
        self.state.read().unwrap().kernels.contains_key(&key)
    }

    /// Whether any direct registration falls inside `keys`. Alias
    /// registrations never count; alias keys carry no key-set bits.
    pub fn has_kernel_for_any_in(&self, keys: KeySet) -> bool {
        let state = self.state.read().unwrap();
        Self::state_has_any(&state, keys)
    }

    pub(crate) fn is_unused(&self) -> bool {
        let state = self.state.read().unwrap();
        state.schema.is_none() && state.kernels.is_empty()
    }

    /// Lock-free hot-path read of the published slot for a runtime key.
    pub(crate) fn lookup(&self, key: DispatchKey) -> Arc<TableEntry> {
        match key.table_index() {
            Some(index) => self.table[index].load_full(),
            None => Arc::clone(&MISSING),
        }
    }

    fn state_has_any(state: &EntryState, keys: KeySet) -> bool {
        state
            .kernels
            .keys()
            .any(|k| !k.is_alias() && keys.has(*k))
    }

    fn kernel_in<'a>(state: &'a EntryState, key: DispatchKey) -> Option<&'a AnnotatedKernel> {
        state
            .kernels
            .get(&key)
            .and_then(|records| records.first())
            .map(|record| &record.kernel)
    }

    // The precedence algorithm. Given a runtime dispatch key, pick the
    // winning kernel in order:
    //   (1) a kernel directly registered to the key;
    //   (2) CompositeExplicitAutogradNonFunctional, for Undefined and for
    //       keys inside that alias's family;
    //   (3) CompositeExplicitAutograd, same condition;
    //   (4) CompositeImplicitAutograd, same condition — except that
    //       (a) AutogradOther resolves to the ambiguous marker when any
    //           backend funnelling into it has a direct kernel, and
    //       (b) the composite never overrides a backend column that already
    //           has a direct or explicit-composite kernel;
    //   (5) the Autograd alias, for keys inside its family;
    //   (6) the process-wide fallback for the key's backend;
    //   (7) the missing marker.
    fn compute_table_entry(
        &self,
        state: &EntryState,
        fallbacks: &FallbackTable,
        key: DispatchKey,
    ) -> TableEntry {
        use AliasKey::*;

        if let Some(direct) = Self::kernel_in(state, key) {
            return TableEntry {
                kernel: direct.clone(),
                provenance: KernelProvenance::DirectKernel,
            };
        }

        for alias in [CompositeExplicitAutogradNonFunctional, CompositeExplicitAutograd] {
            if key == DispatchKey::Undefined || KeySet::is_included_in_alias(key, alias) {
                if let Some(kernel) = Self::kernel_in(state, DispatchKey::Alias(alias)) {
                    return TableEntry {
                        kernel: kernel.clone(),
                        provenance: KernelProvenance::DefaultBackendKernel,
                    };
                }
            }
        }

        // An autograd key defers to its backend column: if that column has
        // a direct kernel (or an explicit composite exists), the implicit
        // composite must not shadow it.
        let has_backend_kernel = Self::state_has_any(
            state,
            KeySet::backend_key_set_from_autograd(key),
        ) || state
            .kernels
            .contains_key(&DispatchKey::Alias(CompositeExplicitAutograd));

        if key == DispatchKey::Undefined
            || KeySet::is_included_in_alias(key, CompositeImplicitAutograd)
        {
            if let Some(kernel) =
                Self::kernel_in(state, DispatchKey::Alias(CompositeImplicitAutograd))
            {
                if key == DispatchKey::Func(st_keys::Functionality::AutogradOther)
                    && Self::state_has_any(state, KeySet::autogradother_backends())
                {
                    return TableEntry {
                        kernel: AMBIGUOUS.clone(),
                        provenance: KernelProvenance::Ambiguous,
                    };
                } else if !has_backend_kernel {
                    return TableEntry {
                        kernel: kernel.clone(),
                        provenance: KernelProvenance::CompositeKernel,
                    };
                }
            }
        }

        if KeySet::is_included_in_alias(key, Autograd) {
            if let Some(kernel) = Self::kernel_in(state, DispatchKey::Alias(Autograd)) {
                return TableEntry {
                    kernel: kernel.clone(),
                    provenance: KernelProvenance::AutogradKernel,
                };
            }
        }

        if let Some(backend) = key.backend_component() {
            if let Some(fallback) = fallbacks.get(backend) {
                return TableEntry {
                    kernel: fallback,
                    provenance: KernelProvenance::BackendFallback,
                };
            }
        }

        TableEntry {
            kernel: MISSING.kernel.clone(),
            provenance: KernelProvenance::Missing,
        }
    }

    // Republishes the single slot owned by `key`, if it owns one.
    fn update_entry(&self, state: &EntryState, fallbacks: &FallbackTable, key: DispatchKey) {
        if let Some(index) = key.table_index() {
            let entry = self.compute_table_entry(state, fallbacks, key);
            self.table[index].store(Arc::new(entry));
        }
    }

    // Republishes `key`'s slot and every slot that can depend on it: the
    // key's implied runtime family, the Undefined slot for the composite
    // aliases (it cannot be represented in a KeySet), and the derived
    // autograd key of a backend-column registration (the ambiguity and
    // backend-kernel checks read it).
    fn update_for_key(&self, state: &EntryState, fallbacks: &FallbackTable, key: DispatchKey) {
        if key == DispatchKey::Undefined {
            self.update_entry(state, fallbacks, key);
            return;
        }
        for runtime_key in KeySet::runtime_key_set(key).keys() {
            self.update_entry(state, fallbacks, runtime_key);
        }
        if matches!(
            key,
            DispatchKey::Alias(AliasKey::CompositeImplicitAutograd)
                | DispatchKey::Alias(AliasKey::CompositeExplicitAutograd)
                | DispatchKey::Alias(AliasKey::CompositeExplicitAutogradNonFunctional)
        ) {
            self.update_entry(state, fallbacks, DispatchKey::Undefined);
        }
        // The explicit composite feeds the backend-kernel check that can
        // suppress the implicit composite at autograd keys, so its family
        // alone is not enough.
        if key == DispatchKey::Alias(AliasKey::CompositeExplicitAutograd) {
            for runtime_key in KeySet::runtime_key_set(DispatchKey::Alias(AliasKey::Autograd)).keys()
            {
                self.update_entry(state, fallbacks, runtime_key);
            }
        }
        if let Some(autograd_key) = key.autograd_key() {
            self.update_entry(state, fallbacks, autograd_key);
        }
    }

    fn update_full(&self, state: &EntryState, fallbacks: &FallbackTable) {
        self.update_entry(state, fallbacks, DispatchKey::Undefined);
        for key in DispatchKey::all_runtime() {
            self.update_entry(state, fallbacks, key);
        }
    }

    /// Re-derives the whole table from the kernel map and compares it
    /// against the live one; any divergence is a logic defect in the
    /// registry itself.
    pub(crate) fn check_invariants(&self, fallbacks: &FallbackTable) -> DispatchResult<()> {
        let state = self.state.read().unwrap();
        self.check_invariants_locked(&state, fallbacks)
    }

    fn check_invariants_locked(
        &self,
        state: &EntryState,
        fallbacks: &FallbackTable,
    ) -> DispatchResult<()> {
        if state.kernels.contains_key(&DispatchKey::Undefined) {
            return Err(DispatchError::InconsistentState {
                operator: self.name.clone(),
                reason: "kernels registered under the Undefined key".to_string(),
            });
        }
        for (key, records) in &state.kernels {
            if records.is_empty() {
                return Err(DispatchError::InconsistentState {
                    operator: self.name.clone(),
                    reason: format!("empty kernel list for dispatch key {key}"),
                });
            }
        }
        for key in std::iter::once(DispatchKey::Undefined).chain(DispatchKey::all_runtime()) {
            let index = match key.table_index() {
                Some(index) => index,
                None => continue,
            };
            let expected = self.compute_table_entry(state, fallbacks, key);
            let live = self.table[index].load();
            if expected.provenance != live.provenance
                || !expected.kernel.kernel.same_identity(&live.kernel.kernel)
            {
                return Err(DispatchError::InconsistentState {
                    operator: self.name.clone(),
                    reason: format!(
                        "derived table disagrees with the live table at {key}\n\
                         canonical state:\n{}\ncomputed table:\n{}",
                        self.dump_state_locked(state),
                        self.dump_computed_table_locked(state, fallbacks)
                    ),
                });
            }
        }
        Ok(())
    }

    /// Explicit registrations only, in canonical key order; no derived
    /// fallback information. Shadowed registrations are marked inactive.
    pub fn dump_state(&self) -> String {
        let state = self.state.read().unwrap();
        self.dump_state_locked(&state)
    }

    fn dump_state_locked(&self, state: &EntryState) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "name: {}", self.name);
        match &state.schema {
            Some(schema) => {
                let _ = writeln!(out, "schema: {}", schema.schema);
                let _ = writeln!(out, "debug: {}", schema.debug);
            }
            None => {
                let _ = writeln!(out, "schema: (none)");
            }
        }
        for key in DispatchKey::all() {
            let records = match state.kernels.get(&key) {
                Some(records) => records,
                None => continue,
            };
            for (i, record) in records.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{key}{}{}: {} :: {} [ {} ]",
                    if key.is_alias() { "[alias]" } else { "" },
                    if i > 0 { " (inactive)" } else { "" },
                    record.kernel.debug,
                    record
                        .kernel
                        .inferred_schema
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "(none)".to_string()),
                    record.kernel.kernel.dump_state(),
                );
            }
        }
        out
    }

    /// The full derived table with per-key provenance, as
    /// `update_full` would publish it.
    pub(crate) fn dump_computed_table(&self, fallbacks: &FallbackTable) -> String {
        let state = self.state.read().unwrap();
        self.dump_computed_table_locked(&state, fallbacks)
    }

    fn dump_computed_table_locked(
        &self,
        state: &EntryState,
        fallbacks: &FallbackTable,
    ) -> String {
        let mut out = String::new();
        for key in std::iter::once(DispatchKey::Undefined).chain(DispatchKey::all_runtime()) {
            let entry = self.compute_table_entry(state, fallbacks, key);
            if entry.kernel.kernel.is_valid() {
                let _ = writeln!(
                    out,
                    "{key}: {}{} [{}]",
                    if entry.kernel.kernel.is_fallthrough() {
                        "fallthrough "
                    } else {
                        ""
                    },
                    entry.kernel.debug,
                    entry.provenance,
                );
            }
        }
        out
    }

    /// Every runtime key whose live table slot holds a valid kernel.
    pub fn list_active_keys(&self) -> Vec<DispatchKey> {
        std::iter::once(DispatchKey::Undefined)
            .chain(DispatchKey::all_runtime())
            .filter(|key| self.lookup(*key).kernel.kernel.is_valid())
            .collect()
    }

    /// Builds the invocation-time error for `key`: an invariant failure if
    /// the registry is internally inconsistent, otherwise the missing-kernel
    /// report enumerating everything that is available.
    pub(crate) fn report_error(&self, fallbacks: &FallbackTable, key: DispatchKey) -> DispatchError {
        if let Err(err) = self.check_invariants(fallbacks) {
            return err;
        }
        let available = {
            let keys = self.list_active_keys();
            if keys.is_empty() {
                "(none)".to_string()
            } else {
                keys.iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        };
        if key == DispatchKey::Undefined {
            DispatchError::MissingKernelForUndefined {
                operator: self.name.clone(),
                available,
            }
        } else {
            DispatchError::MissingKernel {
                operator: self.name.clone(),
                key,
                available,
            }
        }
    }
}

impl std::fmt::Debug for OperatorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
