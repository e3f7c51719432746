// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Key sets: a machine word of runtime dispatch keys.
//!
//! Backend bits occupy the low [`BackendComponent::COUNT`] positions and
//! functionality bits sit above them. A `(functionality, backend)` runtime
//! key contributes one bit on each axis, so a set is a compressed cross
//! product: `has(SparseCUDA)` is true whenever both the `Sparse` and the
//! `CUDA` bit are present, even if they were inserted by different keys.
//! That imprecision is deliberate — it is what lets the whole context fit
//! in one word — and the dispatcher only relies on the exact direction:
//! inserting a key always makes `has` of that key true.
//!
//! `Undefined` and alias keys have no bits. An empty set dispatches to the
//! `Undefined` table slot; aliases are expanded through
//! [`KeySet::runtime_key_set`] during table computation instead.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::backend::BackendComponent;
use crate::key::{AliasKey, DispatchKey, Functionality};

const BACKEND_BITS: u64 = (1 << BackendComponent::COUNT) - 1;
const FUNCTIONALITY_BITS: u64 =
    ((1 << Functionality::COUNT) - 1) << BackendComponent::COUNT;

const fn backend_bit(b: BackendComponent) -> u64 {
    1 << (b as u8)
}

const fn functionality_bit(f: Functionality) -> u64 {
    1 << (BackendComponent::COUNT as u8 + f as u8)
}

/// A bitmask union of runtime dispatch keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeySet {
    bits: u64,
}

impl KeySet {
    pub const EMPTY: KeySet = KeySet { bits: 0 };

    /// Every runtime key.
    pub const FULL: KeySet = KeySet {
        bits: BACKEND_BITS | FUNCTIONALITY_BITS,
    };

    /// The set containing exactly `key`'s bits. Alias keys carry no bits
    /// and must go through [`KeySet::runtime_key_set`] instead.
    pub fn with(key: DispatchKey) -> KeySet {
        debug_assert!(!key.is_alias(), "alias keys are not representable in a KeySet");
        let bits = match key {
            DispatchKey::Undefined | DispatchKey::Alias(_) => 0,
            DispatchKey::Func(f) => functionality_bit(f),
            DispatchKey::Backend(f, b) => functionality_bit(f) | backend_bit(b),
        };
        KeySet { bits }
    }

    pub fn of(keys: &[DispatchKey]) -> KeySet {
        keys.iter()
            .fold(KeySet::EMPTY, |acc, k| acc | KeySet::with(*k))
    }

    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn has(self, key: DispatchKey) -> bool {
        match key {
            DispatchKey::Undefined | DispatchKey::Alias(_) => false,
            DispatchKey::Func(f) => self.bits & functionality_bit(f) != 0,
            DispatchKey::Backend(f, b) => {
                self.bits & functionality_bit(f) != 0 && self.bits & backend_bit(b) != 0
            }
        }
    }

    /// Removes `key`'s functionality bit, keeping all backend bits. This is
    /// how the dispatcher steps past a fallthrough kernel: the dispatched
    /// functionality is masked out and the next-highest key re-extracted.
    pub fn remove(self, key: DispatchKey) -> KeySet {
        let bit = match key.functionality() {
            Some(f) => functionality_bit(f),
            None => 0,
        };
        KeySet { bits: self.bits & !bit }
    }

    /// The key this context dispatches on: the highest functionality bit,
    /// paired with the highest backend bit when that functionality is
    /// per-backend. An empty set (or a per-backend functionality with no
    /// backend bit to pair with) dispatches to `Undefined`.
    pub fn highest_priority_key(self) -> DispatchKey {
        let func_bits = (self.bits & FUNCTIONALITY_BITS) >> BackendComponent::COUNT;
        if func_bits == 0 {
            return DispatchKey::Undefined;
        }
        let f = match Functionality::from_index(63 - func_bits.leading_zeros() as usize) {
            Some(f) => f,
            None => return DispatchKey::Undefined,
        };
        if !f.is_per_backend() {
            return DispatchKey::Func(f);
        }
        let backend_bits = self.bits & BACKEND_BITS;
        if backend_bits == 0 {
            return DispatchKey::Undefined;
        }
        match BackendComponent::from_index(63 - backend_bits.leading_zeros() as usize) {
            Some(b) => DispatchKey::Backend(f, b),
            None => DispatchKey::Undefined,
        }
    }

    /// The runtime keys contained in this set, highest priority first.
    pub fn keys(self) -> Vec<DispatchKey> {
        let mut out = Vec::new();
        for f in Functionality::ALL.iter().rev() {
            if self.bits & functionality_bit(*f) == 0 {
                continue;
            }
            if f.is_per_backend() {
                for b in BackendComponent::ALL.iter().rev() {
                    if self.bits & backend_bit(*b) != 0 {
                        out.push(DispatchKey::Backend(*f, *b));
                    }
                }
            } else {
                out.push(DispatchKey::Func(*f));
            }
        }
        out
    }

    /// The runtime keys an autograd key shadows for its backend column:
    /// the non-autograd per-backend keys of that backend, or the
    /// non-customizable backends for `AutogradOther`. Empty for keys that
    /// are not autograd keys.
    pub fn backend_key_set_from_autograd(key: DispatchKey) -> KeySet {
        match key {
            DispatchKey::Backend(Functionality::AutogradFunctionality, b) => KeySet {
                bits: functionality_bit(Functionality::Dense)
                    | functionality_bit(Functionality::Quantized)
                    | functionality_bit(Functionality::Sparse)
                    | backend_bit(b),
            },
            DispatchKey::Func(Functionality::AutogradOther) => KeySet::autogradother_backends(),
            _ => KeySet::EMPTY,
        }
    }

    /// The non-customizable backends that share the `AutogradOther` key.
    pub const fn autogradother_backends() -> KeySet {
        KeySet {
            bits: functionality_bit(Functionality::Wasm)
                | functionality_bit(Functionality::Julia),
        }
    }

    // Every autograd runtime key.
    const fn autograd_key_set() -> KeySet {
        KeySet {
            bits: functionality_bit(Functionality::AutogradFunctionality)
                | functionality_bit(Functionality::AutogradOther)
                | BACKEND_BITS,
        }
    }

    // Every backend runtime key, customizable or not.
    const fn backend_key_set() -> KeySet {
        KeySet {
            bits: functionality_bit(Functionality::Dense)
                | functionality_bit(Functionality::Quantized)
                | functionality_bit(Functionality::Sparse)
                | functionality_bit(Functionality::Wasm)
                | functionality_bit(Functionality::Julia)
                | BACKEND_BITS,
        }
    }

    const fn non_functional_backend_key_set() -> KeySet {
        KeySet {
            bits: KeySet::backend_key_set().bits & !backend_bit(BackendComponent::Lazy),
        }
    }

    /// The runtime keys a registration to `key` populates: the key itself
    /// for runtime keys, every backend's slot for a per-backend base
    /// marker, and the alias's implied family for alias keys. `Undefined`
    /// is handled out of band by the table-update path.
    pub fn runtime_key_set(key: DispatchKey) -> KeySet {
        match key {
            DispatchKey::Undefined => KeySet::EMPTY,
            DispatchKey::Func(f) if f.is_per_backend() => KeySet {
                bits: functionality_bit(f) | BACKEND_BITS,
            },
            DispatchKey::Func(_) | DispatchKey::Backend(..) => KeySet::with(key),
            DispatchKey::Alias(AliasKey::Autograd) => KeySet::autograd_key_set(),
            DispatchKey::Alias(AliasKey::CompositeImplicitAutograd) => {
                KeySet::backend_key_set() | KeySet::autograd_key_set()
            }
            DispatchKey::Alias(AliasKey::CompositeExplicitAutograd) => KeySet::backend_key_set(),
            DispatchKey::Alias(AliasKey::CompositeExplicitAutogradNonFunctional) => {
                KeySet::non_functional_backend_key_set()
            }
        }
    }

    /// Whether runtime key `key` belongs to `alias`'s implied family.
    pub fn is_included_in_alias(key: DispatchKey, alias: AliasKey) -> bool {
        key != DispatchKey::Undefined
            && KeySet::runtime_key_set(DispatchKey::Alias(alias)).has(key)
    }
}

impl BitOr for KeySet {
    type Output = KeySet;
    fn bitor(self, rhs: KeySet) -> KeySet {
        KeySet {
            bits: self.bits | rhs.bits,
        }
    }
}

impl BitAnd for KeySet {
    type Output = KeySet;
    fn bitand(self, rhs: KeySet) -> KeySet {
        KeySet {
            bits: self.bits & rhs.bits,
        }
    }
}

impl fmt::Display for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySet(")?;
        for (i, key) in self.keys().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_dispatches_undefined() {
        assert_eq!(KeySet::EMPTY.highest_priority_key(), DispatchKey::Undefined);
    }

    #[test]
    fn higher_functionality_wins() {
        let ks = KeySet::of(&[
            DispatchKey::CPU,
            DispatchKey::Backend(Functionality::AutogradFunctionality, BackendComponent::Cpu),
            DispatchKey::Func(Functionality::Tracer),
        ]);
        assert_eq!(
            ks.highest_priority_key(),
            DispatchKey::Func(Functionality::Tracer)
        );
        let after_tracer = ks.remove(DispatchKey::Func(Functionality::Tracer));
        assert_eq!(
            after_tracer.highest_priority_key(),
            DispatchKey::Backend(Functionality::AutogradFunctionality, BackendComponent::Cpu)
        );
    }

    #[test]
    fn higher_backend_wins_within_a_functionality() {
        let ks = KeySet::of(&[DispatchKey::CPU, DispatchKey::CUDA]);
        assert_eq!(ks.highest_priority_key(), DispatchKey::CUDA);
    }

    #[test]
    fn remove_only_strips_the_functionality_bit() {
        let ks = KeySet::of(&[
            DispatchKey::Backend(Functionality::Sparse, BackendComponent::Cuda),
            DispatchKey::CUDA,
        ]);
        let stepped = ks.remove(DispatchKey::Backend(Functionality::Sparse, BackendComponent::Cuda));
        assert_eq!(stepped.highest_priority_key(), DispatchKey::CUDA);
    }

    #[test]
    fn full_set_iterates_every_runtime_key_but_undefined() {
        let keys = KeySet::FULL.keys();
        assert_eq!(keys.len(), crate::NUM_RUNTIME_ENTRIES - 1);
        assert!(!keys.contains(&DispatchKey::Undefined));
    }

    #[test]
    fn alias_families() {
        use AliasKey::*;
        assert!(KeySet::is_included_in_alias(DispatchKey::CPU, CompositeExplicitAutograd));
        assert!(KeySet::is_included_in_alias(DispatchKey::CPU, CompositeImplicitAutograd));
        assert!(!KeySet::is_included_in_alias(DispatchKey::CPU, Autograd));
        assert!(KeySet::is_included_in_alias(
            DispatchKey::Backend(Functionality::AutogradFunctionality, BackendComponent::Cuda),
            Autograd
        ));
        assert!(KeySet::is_included_in_alias(
            DispatchKey::Func(Functionality::AutogradOther),
            Autograd
        ));
        assert!(KeySet::is_included_in_alias(
            DispatchKey::Func(Functionality::Wasm),
            CompositeExplicitAutograd
        ));
        // Tracing never comes from a composite.
        assert!(!KeySet::is_included_in_alias(
            DispatchKey::Func(Functionality::Tracer),
            CompositeImplicitAutograd
        ));
        // The non-functional composite skips the Lazy column.
        assert!(KeySet::is_included_in_alias(
            DispatchKey::CPU,
            CompositeExplicitAutogradNonFunctional
        ));
        assert!(!KeySet::is_included_in_alias(
            DispatchKey::LAZY,
            CompositeExplicitAutogradNonFunctional
        ));
    }

    #[test]
    fn per_backend_marker_expands_to_every_backend() {
        let ks = KeySet::runtime_key_set(DispatchKey::Func(Functionality::Sparse));
        let keys = ks.keys();
        assert_eq!(keys.len(), BackendComponent::COUNT);
        assert!(keys
            .iter()
            .all(|k| k.functionality() == Some(Functionality::Sparse)));
    }

    #[test]
    fn autograd_backend_shadow_sets() {
        let ks = KeySet::backend_key_set_from_autograd(DispatchKey::Backend(
            Functionality::AutogradFunctionality,
            BackendComponent::Cuda,
        ));
        assert!(ks.has(DispatchKey::CUDA));
        assert!(ks.has(DispatchKey::Backend(Functionality::Sparse, BackendComponent::Cuda)));
        assert!(!ks.has(DispatchKey::CPU));

        let other = KeySet::backend_key_set_from_autograd(DispatchKey::Func(
            Functionality::AutogradOther,
        ));
        assert!(other.has(DispatchKey::Func(Functionality::Wasm)));
        assert!(other.has(DispatchKey::Func(Functionality::Julia)));
        assert!(!other.has(DispatchKey::CPU));

        assert!(KeySet::backend_key_set_from_autograd(DispatchKey::CPU).is_empty());
    }
}
