// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Memory access trait for guest memory.
//!
//! Abstracts memory operations so the kernel and the CPU core can touch
//! guest RAM without depending on a concrete backing store.

use rupsp_common::PspAddr;
use thiserror::Error;

/// Memory access error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryFault {
    #[error("unmapped address: 0x{0:08X}")]
    Unmapped(PspAddr),
    #[error("misaligned access at 0x{0:08X}")]
    Misaligned(PspAddr),
}

/// Trait for guest memory access.
///
/// All multi-byte reads/writes are little-endian (matching the Allegrex).
pub trait MemoryAccess {
    fn is_valid_address(&self, addr: PspAddr) -> bool;
    fn is_valid_range(&self, addr: PspAddr, size: u32) -> bool;
    fn read_u8(&self, addr: PspAddr) -> Result<u8, MemoryFault>;
    fn read_u32(&self, addr: PspAddr) -> Result<u32, MemoryFault>;
    fn read_u64(&self, addr: PspAddr) -> Result<u64, MemoryFault>;
    fn write_u8(&mut self, addr: PspAddr, val: u8) -> Result<(), MemoryFault>;
    fn write_u32(&mut self, addr: PspAddr, val: u32) -> Result<(), MemoryFault>;
    fn write_u64(&mut self, addr: PspAddr, val: u64) -> Result<(), MemoryFault>;
    /// Fill `len` bytes at `addr` with `val`.
    fn memset(&mut self, addr: PspAddr, val: u8, len: u32) -> Result<(), MemoryFault>;
    /// Copy `len` bytes inside guest memory.
    fn memcpy(&mut self, dst: PspAddr, src: PspAddr, len: u32) -> Result<(), MemoryFault>;
    /// Copy host bytes into guest memory.
    fn write_bytes(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), MemoryFault>;
    /// Copy guest bytes out to the host.
    fn read_bytes(&self, addr: PspAddr, len: u32) -> Result<Vec<u8>, MemoryFault>;
}
