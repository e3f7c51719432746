// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Dispatch key algebra for the SpiralTorch operator dispatcher.
//!
//! A dispatch key tags one slice of dispatchable behaviour: either a
//! `(functionality, backend)` pair such as `SparseCUDA`, a functionality
//! that does not vary per backend such as `Tracer`, or an alias that stands
//! for a whole family of runtime keys during dispatch-table computation.
//! [`KeySet`] packs runtime keys into a single machine word so that the
//! dispatcher can extract the highest-priority key of a call context with a
//! couple of bit operations.

pub mod backend;
pub mod key;
pub mod keyset;

pub use backend::BackendComponent;
pub use key::{AliasKey, DispatchKey, Functionality, ParseKeyError, NUM_RUNTIME_ENTRIES};
pub use keyset::KeySet;

// Functionality bits and backend bits share one 64-bit word.
const _: () = assert!(
    Functionality::COUNT + BackendComponent::COUNT <= 64,
    "functionality and backend bits must fit a single 64-bit key set"
);

// A handful of places pack backend indices into 16-bit masks.
const _: () = assert!(
    BackendComponent::COUNT <= 16,
    "at most 16 backend components are supported"
);
