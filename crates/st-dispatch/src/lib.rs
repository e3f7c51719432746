// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! The SpiralTorch operator-dispatch core.
//!
//! Operations are declared by name on a [`Dispatcher`]; kernels are
//! registered per dispatch key (or to aliases covering whole key families),
//! and every registration change republishes the affected slots of the
//! operator's precomputed dispatch table. Invocation extracts the
//! highest-priority key from the call context's [`st_keys::KeySet`] and
//! reads its table slot lock-free — no precedence logic runs on the hot
//! path.
//!
//! ```
//! use st_dispatch::{Dispatcher, KernelFunction};
//! use st_dispatch::keys::{DispatchKey, KeySet};
//!
//! let dispatcher = Dispatcher::new();
//! let add = dispatcher.declare("demo::add");
//! dispatcher
//!     .register_schema(&add, "(int, int) -> int", "demo")
//!     .unwrap();
//! dispatcher
//!     .register_kernel(
//!         &add,
//!         Some(DispatchKey::CPU),
//!         KernelFunction::from_typed(|(a, b): (i64, i64)| a + b),
//!         "demo cpu kernel",
//!     )
//!     .unwrap();
//!
//! let keys = KeySet::of(&[DispatchKey::CPU]);
//! let sum: i64 = dispatcher.call_typed(&add, keys, (2i64, 3i64)).unwrap();
//! assert_eq!(sum, 5);
//! ```

pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod schema;
pub mod telemetry;
pub mod value;

pub use dispatch::{
    Dispatcher, KernelProvenance, KernelToken, OperatorHandle, TypedOperatorHandle,
};
pub use error::{DispatchError, DispatchResult};
pub use kernel::{AnnotatedKernel, BoxedKernel, CallSignature, KernelFunction};
pub use schema::{FunctionSchema, TypeKind};
pub use value::{IntoValue, KernelTuple, Stack, TensorRef, Value};

/// Re-export of the key algebra this crate dispatches over.
pub use st_keys as keys;
