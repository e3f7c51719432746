// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Backend components: the physical or virtual execution targets a
//! per-backend functionality can be customised for.

use std::fmt;

/// One execution target. The discriminant doubles as the backend's bit
/// index inside a [`crate::KeySet`]; a higher index wins when a call
/// context carries several backend bits (CUDA outranks CPU).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendComponent {
    Cpu = 0,
    Cuda,
    Hip,
    Mps,
    Wgpu,
    /// Graph-capture backend: records programs instead of executing them.
    /// The only "functional" backend; the explicit-non-functional composite
    /// alias excludes its column.
    Lazy,
}

impl BackendComponent {
    /// Every backend, in ascending priority order.
    pub const ALL: [BackendComponent; 6] = [
        BackendComponent::Cpu,
        BackendComponent::Cuda,
        BackendComponent::Hip,
        BackendComponent::Mps,
        BackendComponent::Wgpu,
        BackendComponent::Lazy,
    ];

    pub const COUNT: usize = BackendComponent::ALL.len();

    pub(crate) const fn from_index(index: usize) -> Option<BackendComponent> {
        match index {
            0 => Some(BackendComponent::Cpu),
            1 => Some(BackendComponent::Cuda),
            2 => Some(BackendComponent::Hip),
            3 => Some(BackendComponent::Mps),
            4 => Some(BackendComponent::Wgpu),
            5 => Some(BackendComponent::Lazy),
            _ => None,
        }
    }

    /// Whether this backend traces programs rather than executing them.
    pub const fn is_functional(self) -> bool {
        matches!(self, BackendComponent::Lazy)
    }

    pub const fn name(self) -> &'static str {
        match self {
            BackendComponent::Cpu => "CPU",
            BackendComponent::Cuda => "CUDA",
            BackendComponent::Hip => "HIP",
            BackendComponent::Mps => "MPS",
            BackendComponent::Wgpu => "WGPU",
            BackendComponent::Lazy => "Lazy",
        }
    }
}

impl fmt::Display for BackendComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_round_trip() {
        for (i, b) in BackendComponent::ALL.iter().enumerate() {
            assert_eq!(BackendComponent::from_index(i), Some(*b));
            assert_eq!(*b as usize, i);
        }
        assert_eq!(BackendComponent::from_index(BackendComponent::COUNT), None);
    }

    #[test]
    fn lazy_is_the_only_functional_backend() {
        let functional: Vec<_> = BackendComponent::ALL
            .iter()
            .filter(|b| b.is_functional())
            .collect();
        assert_eq!(functional, vec![&BackendComponent::Lazy]);
    }
}
