// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod chunk_file;
pub mod error;
pub mod settings;
pub mod types;

pub use chunk_file::{Persist, PointerWrap};
pub use error::ResultCode;
pub use types::*;
