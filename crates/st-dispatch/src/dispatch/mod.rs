// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Operator registry entries and the dispatcher that owns them.

pub mod dispatcher;
pub mod entry;

pub use dispatcher::{Dispatcher, OperatorHandle, TypedOperatorHandle};
pub use entry::{KernelProvenance, KernelToken, OperatorEntry, TableEntry};
