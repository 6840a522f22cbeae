// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Encoders for the handful of instructions the kernel writes into guest
//! memory (trampolines and idle loops).

/// `nop` (sll zero, zero, 0).
pub const fn make_nop() -> u32 {
    0
}

/// `jr ra`.
pub const fn make_jr_ra() -> u32 {
    0x03E0_0008
}

/// `b offset` (beq zero, zero, offset), offset in instructions.
pub const fn make_b(offset: i16) -> u32 {
    0x1000_0000 | (offset as u16 as u32)
}

/// `lui rt, imm`.
pub const fn make_lui(rt: u32, imm: u16) -> u32 {
    0x3C00_0000 | ((rt & 0x1F) << 16) | imm as u32
}

/// `syscall code`.
pub const fn make_syscall(code: u32) -> u32 {
    ((code & 0xF_FFFF) << 6) | 0x0C
}

/// `break code`.
pub const fn make_break(code: u32) -> u32 {
    ((code & 0xF_FFFF) << 6) | 0x0D
}

/// Extract the code field of a `syscall` instruction, if it is one.
pub const fn decode_syscall(op: u32) -> Option<u32> {
    if op & 0xFC00_003F == 0x0C {
        Some((op >> 6) & 0xF_FFFF)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_to_self() {
        // b -1 loops on the delay slot before it.
        assert_eq!(make_b(-1), 0x1000_FFFF);
    }

    #[test]
    fn test_syscall_roundtrip() {
        let op = make_syscall(0xFF003);
        assert_eq!(decode_syscall(op), Some(0xFF003));
        assert_eq!(decode_syscall(make_jr_ra()), None);
    }

    #[test]
    fn test_lui_ra() {
        assert_eq!(make_lui(31, 0x0800), 0x3C1F_0800);
    }
}
