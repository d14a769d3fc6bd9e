// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-wide runtime knobs for the watermark encoder crates.
//!
//! [`determinism`] derives reproducible RNG streams for weight initialisation
//! and [`tracing`] installs the global subscriber used by every crate.

pub mod determinism;
pub mod tracing;
