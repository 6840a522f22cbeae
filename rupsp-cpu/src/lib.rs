// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod encoding;
pub mod memory;
pub mod state;

pub use memory::{MemoryAccess, MemoryFault};
pub use state::MipsState;
