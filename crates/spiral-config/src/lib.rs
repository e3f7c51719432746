// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Process-level configuration shared by the SpiralTorch dispatch crates:
//! tracing subscriber bootstrap and env-driven dispatcher behaviour flags.

pub mod dispatch;
pub mod tracing;
