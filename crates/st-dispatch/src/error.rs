// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

use st_keys::DispatchKey;
use thiserror::Error;

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Everything that can go wrong in the dispatch core. Registration-time
/// errors are reported before any published state is mutated; invocation
/// errors are hard failures and are never silently resolved to a fallback.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("operator '{operator}' already has a registered schema: {schema}")]
    SchemaAlreadyRegistered { operator: String, schema: String },

    #[error("operator '{operator}' has no registered schema")]
    NoSchemaRegistered { operator: String },

    #[error(
        "inferred kernel schema does not match the declared operator schema\n  \
         operator: {operator}\n  \
         declared schema: {declared}\n    {declared_debug}\n  \
         inferred schema: {inferred}\n    {inferred_debug}\n  \
         reason: {reason}"
    )]
    SchemaMismatch {
        operator: String,
        declared: String,
        declared_debug: String,
        inferred: String,
        inferred_debug: String,
        reason: String,
    },

    #[error(
        "mismatch in kernel call signatures\n  \
         operator: {operator}\n  \
         kernel 1: {expected}\n    {expected_debug}\n  \
         kernel 2: {seen}\n    {seen_debug}"
    )]
    SignatureMismatch {
        operator: String,
        expected: String,
        expected_debug: String,
        seen: String,
        seen_debug: String,
    },

    #[error(
        "operator '{operator}' has both a CompositeImplicitAutograd kernel and a \
         backend kernel for a backend sharing the {key} key; register a dedicated \
         autograd kernel for that backend to disambiguate"
    )]
    AmbiguousAutogradOther { operator: String, key: DispatchKey },

    #[error(
        "could not run operator '{operator}' with the '{key}' dispatch key: no \
         kernel, composite or backend fallback applies; kernels are available \
         for {available}"
    )]
    MissingKernel {
        operator: String,
        key: DispatchKey,
        available: String,
    },

    #[error(
        "operator '{operator}' was called with no dispatch keys and no catch-all \
         kernel is registered; kernels are available for {available}"
    )]
    MissingKernelForUndefined { operator: String, available: String },

    #[error("type mismatch in dispatch stack: expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },

    #[error("dispatch stack underflow: needed {needed} values, stack holds {have}")]
    StackUnderflow { needed: usize, have: usize },

    #[error("invalid registration for operator '{operator}': {reason}")]
    InvalidRegistration { operator: String, reason: String },

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("dispatch registry invariant violated for operator '{operator}': {reason}")]
    InconsistentState { operator: String, reason: String },

    /// A failure raised by a kernel implementation itself.
    #[error("kernel error: {0}")]
    Kernel(String),

    #[error(transparent)]
    SchemaParse(#[from] crate::schema::SchemaParseError),
}
