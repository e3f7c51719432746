// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Dispatch keys: the tag space the operator dispatcher selects kernels by.
//!
//! The key space is the cross product of a functionality axis (what kind of
//! behaviour runs) and a backend axis (where it runs), plus a small set of
//! alias keys that denote whole families of runtime keys during dispatch
//! table computation. Rather than flattening the cross product into one
//! contiguous integer range, a key is a sum type and the dispatch-table
//! index is derived from an explicit offset table, so there is no
//! hand-maintained "ranges must not overlap" invariant.

use std::fmt;
use std::str::FromStr;

use crate::backend::BackendComponent;

/// One axis of dispatchable behaviour. The discriminant is the
/// functionality's bit index within a [`crate::KeySet`] (offset by the
/// backend bits); a higher discriminant is dispatched first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Functionality {
    /// Ordinary dense compute; customizable per backend.
    Dense = 0,
    /// WebAssembly execution target. A backend in spirit, but it has no
    /// sparse/quantized/autograd variants, so it lives on the functionality
    /// axis and funnels into `AutogradOther` for gradient tracking.
    Wasm,
    /// Julia FFI execution target; same story as `Wasm`.
    Julia,
    /// Quantized compute; customizable per backend.
    Quantized,
    /// Sparse compute; customizable per backend.
    Sparse,
    /// Resolves calls that carry no tensor arguments to a backend.
    BackendSelect,
    /// Catch-all gradient tracking for backends without a dedicated
    /// autograd key (`Wasm`, `Julia`).
    AutogradOther,
    /// Gradient tracking; customizable per backend.
    AutogradFunctionality,
    /// Program tracing; runs above autograd.
    Tracer,
}

impl Functionality {
    /// Every functionality, in ascending dispatch priority.
    pub const ALL: [Functionality; 9] = [
        Functionality::Dense,
        Functionality::Wasm,
        Functionality::Julia,
        Functionality::Quantized,
        Functionality::Sparse,
        Functionality::BackendSelect,
        Functionality::AutogradOther,
        Functionality::AutogradFunctionality,
        Functionality::Tracer,
    ];

    pub const COUNT: usize = Functionality::ALL.len();

    /// The functionalities that map to one dispatch-table slot per backend.
    pub const PER_BACKEND: [Functionality; 4] = [
        Functionality::Dense,
        Functionality::Quantized,
        Functionality::Sparse,
        Functionality::AutogradFunctionality,
    ];

    pub(crate) const fn from_index(index: usize) -> Option<Functionality> {
        match index {
            0 => Some(Functionality::Dense),
            1 => Some(Functionality::Wasm),
            2 => Some(Functionality::Julia),
            3 => Some(Functionality::Quantized),
            4 => Some(Functionality::Sparse),
            5 => Some(Functionality::BackendSelect),
            6 => Some(Functionality::AutogradOther),
            7 => Some(Functionality::AutogradFunctionality),
            8 => Some(Functionality::Tracer),
            _ => None,
        }
    }

    /// Whether this functionality can be customised per backend. If so,
    /// `Func(self)` is only a base marker and the concrete runtime keys are
    /// `Backend(self, b)` for every backend `b`.
    pub const fn is_per_backend(self) -> bool {
        matches!(
            self,
            Functionality::Dense
                | Functionality::Quantized
                | Functionality::Sparse
                | Functionality::AutogradFunctionality
        )
    }

    /// Whether this functionality is a non-customizable backend: a concrete
    /// execution target that shares `AutogradOther` for gradient tracking.
    pub const fn is_autogradother_backend(self) -> bool {
        matches!(self, Functionality::Wasm | Functionality::Julia)
    }

    // Position among the per-backend functionalities; drives the
    // functionality-major block layout of the dispatch table.
    pub(crate) const fn per_backend_index(self) -> Option<usize> {
        match self {
            Functionality::Dense => Some(0),
            Functionality::Quantized => Some(1),
            Functionality::Sparse => Some(2),
            Functionality::AutogradFunctionality => Some(3),
            _ => None,
        }
    }

    // Position among the non-customizable functionalities, which each own a
    // single dispatch-table slot.
    pub(crate) const fn non_customizable_index(self) -> Option<usize> {
        match self {
            Functionality::Wasm => Some(0),
            Functionality::Julia => Some(1),
            Functionality::BackendSelect => Some(2),
            Functionality::AutogradOther => Some(3),
            Functionality::Tracer => Some(4),
            _ => None,
        }
    }
}

const NON_CUSTOMIZABLE_COUNT: usize =
    Functionality::COUNT - Functionality::PER_BACKEND.len();

/// Number of slots in a per-operator dispatch table: the `Undefined` slot,
/// one slot per non-customizable functionality, and one slot per
/// (per-backend functionality, backend) pair.
pub const NUM_RUNTIME_ENTRIES: usize =
    1 + NON_CUSTOMIZABLE_COUNT + Functionality::PER_BACKEND.len() * BackendComponent::COUNT;

/// A synthetic key standing for a family of runtime keys. Alias keys are
/// legal registration targets but never dispatch-table indices and never
/// members of a [`crate::KeySet`]; they are resolved away during table
/// computation. Declaration order is ascending precedence among aliases
/// (runtime keys always outrank all of them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AliasKey {
    /// Every autograd runtime key, including `AutogradOther`.
    Autograd,
    /// Every backend and autograd runtime key: a single implementation
    /// that is differentiable by composition. Also the target of catch-all
    /// registrations.
    CompositeImplicitAutograd,
    /// Every backend runtime key; autograd must be registered separately.
    CompositeExplicitAutograd,
    /// Like `CompositeExplicitAutograd` but excluding functional backends
    /// (the `Lazy` column), which cannot run mutating implementations.
    CompositeExplicitAutogradNonFunctional,
}

impl AliasKey {
    pub const ALL: [AliasKey; 4] = [
        AliasKey::Autograd,
        AliasKey::CompositeImplicitAutograd,
        AliasKey::CompositeExplicitAutograd,
        AliasKey::CompositeExplicitAutogradNonFunctional,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            AliasKey::Autograd => "Autograd",
            AliasKey::CompositeImplicitAutograd => "CompositeImplicitAutograd",
            AliasKey::CompositeExplicitAutograd => "CompositeExplicitAutograd",
            AliasKey::CompositeExplicitAutogradNonFunctional => {
                "CompositeExplicitAutogradNonFunctional"
            }
        }
    }
}

/// A dispatch key: `Undefined` (the no-tag slot), a functionality key, a
/// concrete `(functionality, backend)` runtime key, or an alias.
///
/// `Func(f)` is itself a runtime key when `f` is non-customizable
/// (`Tracer`, `Wasm`, …) and only a base marker when `f` is per-backend
/// (`Dense`, …) — base markers classify and propagate updates but own no
/// dispatch-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    Undefined,
    Func(Functionality),
    Backend(Functionality, BackendComponent),
    Alias(AliasKey),
}

impl DispatchKey {
    pub const CPU: DispatchKey =
        DispatchKey::Backend(Functionality::Dense, BackendComponent::Cpu);
    pub const CUDA: DispatchKey =
        DispatchKey::Backend(Functionality::Dense, BackendComponent::Cuda);
    pub const HIP: DispatchKey =
        DispatchKey::Backend(Functionality::Dense, BackendComponent::Hip);
    pub const MPS: DispatchKey =
        DispatchKey::Backend(Functionality::Dense, BackendComponent::Mps);
    pub const WGPU: DispatchKey =
        DispatchKey::Backend(Functionality::Dense, BackendComponent::Wgpu);
    pub const LAZY: DispatchKey =
        DispatchKey::Backend(Functionality::Dense, BackendComponent::Lazy);

    pub const fn is_alias(self) -> bool {
        matches!(self, DispatchKey::Alias(_))
    }

    /// Whether this key owns a dispatch-table slot.
    pub const fn is_runtime(self) -> bool {
        match self {
            DispatchKey::Undefined => true,
            DispatchKey::Func(f) => !f.is_per_backend(),
            DispatchKey::Backend(f, _) => f.is_per_backend(),
            DispatchKey::Alias(_) => false,
        }
    }

    pub const fn functionality(self) -> Option<Functionality> {
        match self {
            DispatchKey::Func(f) | DispatchKey::Backend(f, _) => Some(f),
            _ => None,
        }
    }

    pub const fn backend_component(self) -> Option<BackendComponent> {
        match self {
            DispatchKey::Backend(_, b) => Some(b),
            _ => None,
        }
    }

    /// The dispatch-table slot this key owns, if any. `Undefined` sits at
    /// slot 0, the non-customizable functionalities follow, and the
    /// per-backend functionalities occupy functionality-major blocks of
    /// [`BackendComponent::COUNT`] slots each.
    pub const fn table_index(self) -> Option<usize> {
        match self {
            DispatchKey::Undefined => Some(0),
            DispatchKey::Func(f) => match f.non_customizable_index() {
                Some(i) => Some(1 + i),
                None => None,
            },
            DispatchKey::Backend(f, b) => match f.per_backend_index() {
                Some(i) => {
                    Some(1 + NON_CUSTOMIZABLE_COUNT + i * BackendComponent::COUNT + b as usize)
                }
                None => None,
            },
            DispatchKey::Alias(_) => None,
        }
    }

    /// The autograd runtime key that tracks gradients for this key's
    /// backend: `Backend(f, b)` maps to `Backend(AutogradFunctionality, b)`
    /// and the non-customizable backends map to `AutogradOther`. Keys
    /// without a backend column have no derived autograd key.
    pub const fn autograd_key(self) -> Option<DispatchKey> {
        match self {
            DispatchKey::Backend(f, b) => {
                if f.is_per_backend()
                    && !matches!(f, Functionality::AutogradFunctionality)
                {
                    Some(DispatchKey::Backend(Functionality::AutogradFunctionality, b))
                } else {
                    None
                }
            }
            DispatchKey::Func(f) => {
                if f.is_autogradother_backend() {
                    Some(DispatchKey::Func(Functionality::AutogradOther))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Every key in canonical order: `Undefined`, functionality keys,
    /// per-backend runtime keys in table order, then aliases. The order is
    /// stable and is what diagnostics iterate.
    pub fn all() -> impl Iterator<Item = DispatchKey> {
        let funcs = Functionality::ALL.into_iter().map(DispatchKey::Func);
        let per_backend = Functionality::PER_BACKEND.into_iter().flat_map(|f| {
            BackendComponent::ALL
                .into_iter()
                .map(move |b| DispatchKey::Backend(f, b))
        });
        let aliases = AliasKey::ALL.into_iter().map(DispatchKey::Alias);
        std::iter::once(DispatchKey::Undefined)
            .chain(funcs)
            .chain(per_backend)
            .chain(aliases)
    }

    /// Every runtime key except `Undefined`, in dispatch-table order.
    pub fn all_runtime() -> impl Iterator<Item = DispatchKey> {
        DispatchKey::all().filter(|k| k.is_runtime() && *k != DispatchKey::Undefined)
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchKey::Undefined => f.write_str("Undefined"),
            DispatchKey::Func(func) => {
                let name = match func {
                    Functionality::Dense => "Dense",
                    Functionality::Wasm => "Wasm",
                    Functionality::Julia => "Julia",
                    Functionality::Quantized => "Quantized",
                    Functionality::Sparse => "Sparse",
                    Functionality::BackendSelect => "BackendSelect",
                    Functionality::AutogradOther => "AutogradOther",
                    Functionality::AutogradFunctionality => "AutogradFunctionality",
                    Functionality::Tracer => "Tracer",
                };
                f.write_str(name)
            }
            DispatchKey::Backend(func, b) => match func {
                Functionality::Dense => f.write_str(b.name()),
                Functionality::Quantized => write!(f, "Quantized{}", b.name()),
                Functionality::Sparse => write!(f, "Sparse{}", b.name()),
                Functionality::AutogradFunctionality => write!(f, "Autograd{}", b.name()),
                _ => write!(f, "Invalid{}{:?}", b.name(), func),
            },
            DispatchKey::Alias(a) => f.write_str(a.name()),
        }
    }
}

/// Error returned when a dispatch key name cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("unrecognised dispatch key '{0}'")]
pub struct ParseKeyError(pub String);

impl FromStr for DispatchKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DispatchKey::all()
            .find(|k| k.to_string() == s)
            .ok_or_else(|| ParseKeyError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_indices_are_dense_and_unique() {
        let mut seen = HashSet::new();
        for key in DispatchKey::all() {
            if let Some(ix) = key.table_index() {
                assert!(ix < NUM_RUNTIME_ENTRIES, "{key} out of range");
                assert!(seen.insert(ix), "{key} collides at slot {ix}");
            }
        }
        assert_eq!(seen.len(), NUM_RUNTIME_ENTRIES);
    }

    #[test]
    fn base_markers_and_aliases_own_no_slot() {
        assert_eq!(DispatchKey::Func(Functionality::Dense).table_index(), None);
        assert_eq!(
            DispatchKey::Alias(AliasKey::Autograd).table_index(),
            None
        );
        assert_eq!(DispatchKey::Undefined.table_index(), Some(0));
    }

    #[test]
    fn runtime_classification() {
        assert!(DispatchKey::CPU.is_runtime());
        assert!(DispatchKey::Func(Functionality::Tracer).is_runtime());
        assert!(DispatchKey::Undefined.is_runtime());
        assert!(!DispatchKey::Func(Functionality::Sparse).is_runtime());
        assert!(!DispatchKey::Alias(AliasKey::CompositeImplicitAutograd).is_runtime());
    }

    #[test]
    fn autograd_key_derivation() {
        assert_eq!(
            DispatchKey::CUDA.autograd_key(),
            Some(DispatchKey::Backend(
                Functionality::AutogradFunctionality,
                BackendComponent::Cuda
            ))
        );
        assert_eq!(
            DispatchKey::Backend(Functionality::Sparse, BackendComponent::Cpu).autograd_key(),
            Some(DispatchKey::Backend(
                Functionality::AutogradFunctionality,
                BackendComponent::Cpu
            ))
        );
        assert_eq!(
            DispatchKey::Func(Functionality::Wasm).autograd_key(),
            Some(DispatchKey::Func(Functionality::AutogradOther))
        );
        assert_eq!(
            DispatchKey::Backend(
                Functionality::AutogradFunctionality,
                BackendComponent::Cpu
            )
            .autograd_key(),
            None
        );
        assert_eq!(DispatchKey::Func(Functionality::Tracer).autograd_key(), None);
    }

    #[test]
    fn display_parse_round_trip() {
        for key in DispatchKey::all() {
            let text = key.to_string();
            let parsed: DispatchKey = text.parse().unwrap();
            assert_eq!(parsed, key, "round trip through '{text}'");
        }
        assert!("NotAKey".parse::<DispatchKey>().is_err());
    }

    #[test]
    fn key_names_compose_functionality_and_backend() {
        assert_eq!(DispatchKey::CPU.to_string(), "CPU");
        assert_eq!(
            DispatchKey::Backend(Functionality::Sparse, BackendComponent::Cuda).to_string(),
            "SparseCUDA"
        );
        assert_eq!(
            DispatchKey::Backend(
                Functionality::AutogradFunctionality,
                BackendComponent::Mps
            )
            .to_string(),
            "AutogradMPS"
        );
        assert_eq!(
            DispatchKey::Alias(AliasKey::CompositeExplicitAutogradNonFunctional).to_string(),
            "CompositeExplicitAutogradNonFunctional"
        );
    }
}
