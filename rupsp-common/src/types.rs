// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Guest address (32-bit MIPS).
pub type PspAddr = u32;

/// Kernel object ID. Signed on the guest side; negative values are errors.
pub type SceUid = i32;

/// Invalid / "current thread" sentinel ID.
pub const INVALID_UID: SceUid = 0;

/// Maximum kernel object name length (excluding the terminator).
pub const KERNELOBJECT_MAX_NAME_LENGTH: usize = 31;

/// Base of main RAM.
pub const PSP_RAM_BASE: PspAddr = 0x0800_0000;

/// Size of main RAM (32 MiB on the PSP-2000 and later).
pub const PSP_RAM_SIZE: u32 = 0x0200_0000;

/// Kernel partition: bottom 8 MiB of main RAM.
pub const KERNEL_PARTITION_BASE: PspAddr = PSP_RAM_BASE;
pub const KERNEL_PARTITION_SIZE: u32 = 0x0080_0000;

/// User partition: the rest of main RAM.
pub const USER_PARTITION_BASE: PspAddr = KERNEL_PARTITION_BASE + KERNEL_PARTITION_SIZE;
pub const USER_PARTITION_SIZE: u32 = PSP_RAM_SIZE - KERNEL_PARTITION_SIZE;

/// Allocation granularity of the kernel block allocators.
pub const ALLOC_GRAIN: u32 = 0x100;

/// Allegrex clock (222 MHz).
pub const CPU_HZ: u64 = 222_000_000;

/// Convert microseconds to CPU cycles.
#[inline]
pub const fn us_to_cycles(us: u64) -> u64 {
    // Split to avoid overflow on huge delays.
    (us / 1_000_000) * CPU_HZ + (us % 1_000_000) * CPU_HZ / 1_000_000
}

/// Convert CPU cycles to microseconds.
#[inline]
pub const fn cycles_to_us(cycles: u64) -> u64 {
    (cycles / CPU_HZ) * 1_000_000 + (cycles % CPU_HZ) * 1_000_000 / CPU_HZ
}

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    value.wrapping_add(mask) & !mask
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(value: u32, alignment: u32) -> u32 {
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, ALLOC_GRAIN), 0);
        assert_eq!(align_up(1, ALLOC_GRAIN), ALLOC_GRAIN);
        assert_eq!(align_up(ALLOC_GRAIN, ALLOC_GRAIN), ALLOC_GRAIN);
        assert_eq!(align_up(0x201, 0x10), 0x210);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0x1FF, ALLOC_GRAIN), 0x100);
        assert_eq!(align_down(0x0880_0010, 0x10), 0x0880_0010);
    }

    #[test]
    fn test_cycle_conversion() {
        assert_eq!(us_to_cycles(1), 222);
        assert_eq!(us_to_cycles(1_000_000), CPU_HZ);
        assert_eq!(cycles_to_us(222 * 1010), 1010);
        assert_eq!(cycles_to_us(us_to_cycles(123_456_789)), 123_456_789);
    }

    #[test]
    fn test_partitions_cover_ram() {
        assert_eq!(USER_PARTITION_BASE, 0x0880_0000);
        assert_eq!(USER_PARTITION_BASE + USER_PARTITION_SIZE, PSP_RAM_BASE + PSP_RAM_SIZE);
    }
}
