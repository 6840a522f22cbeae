// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rupsp_common::{Persist, PointerWrap, PspAddr};

// MIPS general-purpose register numbers.
pub const MIPS_REG_ZERO: usize = 0;
pub const MIPS_REG_V0: usize = 2;
pub const MIPS_REG_V1: usize = 3;
pub const MIPS_REG_A0: usize = 4;
pub const MIPS_REG_A1: usize = 5;
pub const MIPS_REG_A2: usize = 6;
pub const MIPS_REG_A3: usize = 7;
pub const MIPS_REG_T0: usize = 8;
pub const MIPS_REG_T7: usize = 15;
pub const MIPS_REG_T8: usize = 24;
pub const MIPS_REG_T9: usize = 25;
pub const MIPS_REG_K0: usize = 26;
pub const MIPS_REG_GP: usize = 28;
pub const MIPS_REG_SP: usize = 29;
pub const MIPS_REG_FP: usize = 30;
pub const MIPS_REG_RA: usize = 31;

/// VFPU control register indices.
pub mod vfpu_ctrl {
    pub const SPREFIX: usize = 0;
    pub const TPREFIX: usize = 1;
    pub const DPREFIX: usize = 2;
    pub const CC: usize = 3;
    pub const INF4: usize = 4;
    pub const REV: usize = 7;
    pub const RCX0: usize = 8;
    pub const RCX1: usize = 9;
    pub const RCX2: usize = 10;
    pub const RCX3: usize = 11;
    pub const RCX4: usize = 12;
    pub const RCX7: usize = 15;
}

pub const NUM_VFPU_REGS: usize = 128;
pub const NUM_VFPU_CTRL: usize = 16;

/// Storage position of each VFPU register.
///
/// Registers are kept row-major within each 4x4 matrix so that the common
/// column accesses touch consecutive words. Older states stored them in
/// plain register-number order; this table converts between the two.
pub const fn vfpu_offset_table() -> [usize; NUM_VFPU_REGS] {
    let mut table = [0usize; NUM_VFPU_REGS];
    let mut i = 0;
    let mut m = 0;
    while m < 8 {
        let mut k = 0;
        while k < 4 {
            let mut j = 0;
            while j < 4 {
                table[m * 4 + k + j * 32] = i;
                i += 1;
                j += 1;
            }
            k += 1;
        }
        m += 1;
    }
    table
}

/// Allegrex CPU state: the live register file of whichever thread is
/// currently switched in.
#[derive(Debug, Clone, PartialEq)]
pub struct MipsState {
    /// General-purpose registers r0-r31.
    pub r: [u32; 32],
    /// FPU registers (raw bits).
    pub f: [u32; 32],
    /// VFPU registers (raw bits, stored in `vfpu_offset_table` order).
    pub v: [u32; NUM_VFPU_REGS],
    pub vfpu_ctrl: [u32; NUM_VFPU_CTRL],
    pub pc: PspAddr,
    pub hi: u32,
    pub lo: u32,
    pub fpcond: u32,
    pub fcr31: u32,
    /// Load-linked flag, cleared on every context load.
    pub ll_bit: bool,
}

impl Default for MipsState {
    fn default() -> Self {
        Self {
            r: [0; 32],
            f: [0; 32],
            v: [0; NUM_VFPU_REGS],
            vfpu_ctrl: [0; NUM_VFPU_CTRL],
            pc: 0,
            hi: 0,
            lo: 0,
            fpcond: 0,
            fcr31: 0,
            ll_bit: false,
        }
    }
}

impl MipsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a general-purpose register.
    #[inline]
    pub fn reg(&self, index: usize) -> u32 {
        self.r[index]
    }

    /// Set a general-purpose register. Writes to r0 are discarded.
    #[inline]
    pub fn set_reg(&mut self, index: usize, value: u32) {
        if index != MIPS_REG_ZERO {
            self.r[index] = value;
        }
    }

    #[inline]
    pub fn sp(&self) -> u32 {
        self.r[MIPS_REG_SP]
    }

    #[inline]
    pub fn ra(&self) -> u32 {
        self.r[MIPS_REG_RA]
    }
}

impl Persist for MipsState {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.section("MIPSState", 1, 1, |p, _| {
            p.sync(&mut self.r);
            p.sync(&mut self.f);
            p.sync(&mut self.v);
            p.sync(&mut self.vfpu_ctrl);
            p.sync(&mut self.pc);
            p.sync(&mut self.hi);
            p.sync(&mut self.lo);
            p.sync(&mut self.fpcond);
            p.sync(&mut self.fcr31);
            p.sync(&mut self.ll_bit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_table_is_permutation() {
        let table = vfpu_offset_table();
        let mut seen = [false; NUM_VFPU_REGS];
        for &off in table.iter() {
            assert!(!seen[off]);
            seen[off] = true;
        }
        // First matrix, first column lands in the first four slots.
        assert_eq!(table[0], 0);
        assert_eq!(table[32], 1);
        assert_eq!(table[64], 2);
        assert_eq!(table[96], 3);
        assert_eq!(table[1], 4);
    }

    #[test]
    fn test_r0_is_hardwired() {
        let mut cpu = MipsState::new();
        cpu.set_reg(MIPS_REG_ZERO, 5);
        cpu.set_reg(MIPS_REG_V0, 7);
        assert_eq!(cpu.reg(MIPS_REG_ZERO), 0);
        assert_eq!(cpu.reg(MIPS_REG_V0), 7);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut cpu = MipsState::new();
        cpu.r[MIPS_REG_SP] = 0x09ff_fff0;
        cpu.v[127] = 0x7f80_0001;
        cpu.pc = 0x0880_0100;
        let mut p = PointerWrap::writer();
        p.sync(&mut cpu);
        let bytes = p.into_bytes();

        let mut loaded = MipsState::new();
        let mut p = PointerWrap::reader(&bytes);
        p.sync(&mut loaded);
        assert!(p.check().is_ok());
        assert_eq!(loaded, cpu);
    }
}
