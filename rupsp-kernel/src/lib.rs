// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! PSP kernel thread manager: threads, scheduling, waits, callbacks and
//! the `sceKernel*` entry points that drive them.

pub mod callback;
pub mod handle_table;
pub mod kernel;
pub mod memory;
pub mod mips_call;
pub mod objects;
pub mod scheduler;
pub mod svc;
#[cfg(test)]
mod testing;
pub mod thread;
pub mod thread_events;
pub mod thread_queue;
pub mod threadman;
pub mod timing;
pub mod wait;

pub use kernel::KernelCore;
pub use threadman::DebugThreadInfo;
