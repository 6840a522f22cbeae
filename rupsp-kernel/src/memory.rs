// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest RAM and the kernel/user block allocators.
//!
//! Main RAM is a flat 32 MiB window at 0x08000000 backed by an anonymous
//! mmap. Thread stacks and kernel trampolines are carved out of it by two
//! first-fit block allocators, one per partition.

use log::{debug, warn};
use memmap2::MmapMut;
use thiserror::Error;

use rupsp_common::{
    align_up, Persist, PointerWrap, PspAddr, ALLOC_GRAIN, KERNEL_PARTITION_BASE,
    KERNEL_PARTITION_SIZE, PSP_RAM_BASE, PSP_RAM_SIZE, USER_PARTITION_BASE, USER_PARTITION_SIZE,
};
use rupsp_cpu::{MemoryAccess, MemoryFault};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned while setting up guest memory.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("failed to create backing mmap: {0}")]
    MmapFailed(#[from] std::io::Error),
}

/// Result alias for memory setup.
pub type MemoryResult<T> = Result<T, MemoryError>;

// ---------------------------------------------------------------------------
// Guest RAM
// ---------------------------------------------------------------------------

/// Flat guest RAM window.
pub struct GuestMemory {
    base: PspAddr,
    backing: MmapMut,
}

impl GuestMemory {
    /// Map `size` bytes of zeroed RAM at guest address `base`.
    pub fn new(base: PspAddr, size: u32) -> MemoryResult<Self> {
        let backing = MmapMut::map_anon(size as usize)?;
        debug!("Guest RAM mapped at 0x{:08X} ({:#X} bytes)", base, size);
        Ok(Self { base, backing })
    }

    pub fn base(&self) -> PspAddr {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.backing.len() as u32
    }

    /// Translate a guest range to a host offset range.
    fn range(&self, addr: PspAddr, len: u32) -> Result<std::ops::Range<usize>, MemoryFault> {
        // Cached/uncached mirrors share the same RAM.
        let addr = addr & 0x3FFF_FFFF;
        let offset = addr.checked_sub(self.base).ok_or(MemoryFault::Unmapped(addr))? as usize;
        let end = offset
            .checked_add(len as usize)
            .ok_or(MemoryFault::Unmapped(addr))?;
        if end > self.backing.len() {
            return Err(MemoryFault::Unmapped(addr));
        }
        Ok(offset..end)
    }
}

impl MemoryAccess for GuestMemory {
    fn is_valid_address(&self, addr: PspAddr) -> bool {
        self.range(addr, 1).is_ok()
    }

    fn is_valid_range(&self, addr: PspAddr, size: u32) -> bool {
        self.range(addr, size).is_ok()
    }

    fn read_u8(&self, addr: PspAddr) -> Result<u8, MemoryFault> {
        let r = self.range(addr, 1)?;
        Ok(self.backing[r.start])
    }

    fn read_u32(&self, addr: PspAddr) -> Result<u32, MemoryFault> {
        if addr & 3 != 0 {
            return Err(MemoryFault::Misaligned(addr));
        }
        let r = self.range(addr, 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.backing[r]);
        Ok(u32::from_le_bytes(word))
    }

    fn read_u64(&self, addr: PspAddr) -> Result<u64, MemoryFault> {
        let lo = self.read_u32(addr)? as u64;
        let hi = self.read_u32(addr.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    fn write_u8(&mut self, addr: PspAddr, val: u8) -> Result<(), MemoryFault> {
        let r = self.range(addr, 1)?;
        self.backing[r.start] = val;
        Ok(())
    }

    fn write_u32(&mut self, addr: PspAddr, val: u32) -> Result<(), MemoryFault> {
        if addr & 3 != 0 {
            return Err(MemoryFault::Misaligned(addr));
        }
        let r = self.range(addr, 4)?;
        self.backing[r].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    fn write_u64(&mut self, addr: PspAddr, val: u64) -> Result<(), MemoryFault> {
        self.write_u32(addr, val as u32)?;
        self.write_u32(addr.wrapping_add(4), (val >> 32) as u32)
    }

    fn memset(&mut self, addr: PspAddr, val: u8, len: u32) -> Result<(), MemoryFault> {
        let r = self.range(addr, len)?;
        self.backing[r].fill(val);
        Ok(())
    }

    fn memcpy(&mut self, dst: PspAddr, src: PspAddr, len: u32) -> Result<(), MemoryFault> {
        let s = self.range(src, len)?;
        let d = self.range(dst, len)?;
        self.backing.copy_within(s, d.start);
        Ok(())
    }

    fn write_bytes(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), MemoryFault> {
        let r = self.range(addr, data.len() as u32)?;
        self.backing[r].copy_from_slice(data);
        Ok(())
    }

    fn read_bytes(&self, addr: PspAddr, len: u32) -> Result<Vec<u8>, MemoryFault> {
        let r = self.range(addr, len)?;
        Ok(self.backing[r].to_vec())
    }
}

impl Persist for GuestMemory {
    fn persist(&mut self, p: &mut PointerWrap) {
        let mut size = self.size();
        p.sync(&mut size);
        if size != self.size() {
            p.set_error(
                rupsp_common::chunk_file::ErrorLevel::Failure,
                &format!("RAM size mismatch ({:#X} != {:#X})", size, self.size()),
            );
            return;
        }
        p.do_bytes(&mut self.backing[..]);
    }
}

// ---------------------------------------------------------------------------
// Block allocator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Block {
    start: PspAddr,
    size: u32,
    taken: bool,
    tag: String,
}

impl Persist for Block {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.sync(&mut self.start);
        p.sync(&mut self.size);
        p.sync(&mut self.taken);
        p.sync(&mut self.tag);
    }
}

/// First-fit allocator over one memory partition.
///
/// Blocks always tile the whole partition; free neighbors are merged on
/// release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocator {
    start: PspAddr,
    size: u32,
    grain: u32,
    blocks: Vec<Block>,
}

impl BlockAllocator {
    pub fn new(start: PspAddr, size: u32, grain: u32) -> Self {
        Self {
            start,
            size,
            grain,
            blocks: vec![Block {
                start,
                size,
                taken: false,
                tag: String::new(),
            }],
        }
    }

    /// Allocate `size` bytes, rounded up to the grain. Returns the address,
    /// or `None` when no free block is large enough.
    pub fn alloc(&mut self, size: u32, from_top: bool, tag: &str) -> Option<PspAddr> {
        let size = align_up(size.max(1), self.grain);
        let fits = |b: &Block| !b.taken && b.size >= size;
        let idx = if from_top {
            self.blocks.iter().rposition(fits)?
        } else {
            self.blocks.iter().position(fits)?
        };

        let block = &mut self.blocks[idx];
        let rest = block.size - size;
        let addr = if rest == 0 {
            block.taken = true;
            block.tag = tag.to_string();
            block.start
        } else if from_top {
            block.size = rest;
            let addr = block.start + rest;
            self.blocks.insert(
                idx + 1,
                Block {
                    start: addr,
                    size,
                    taken: true,
                    tag: tag.to_string(),
                },
            );
            addr
        } else {
            let addr = block.start;
            block.start += size;
            block.size = rest;
            self.blocks.insert(
                idx,
                Block {
                    start: addr,
                    size,
                    taken: true,
                    tag: tag.to_string(),
                },
            );
            addr
        };
        debug!("Alloc {:#X} bytes at 0x{:08X} ({})", size, addr, tag);
        Some(addr)
    }

    /// Release a block previously returned by [`alloc`](Self::alloc).
    pub fn free(&mut self, addr: PspAddr) -> bool {
        let Some(idx) = self.blocks.iter().position(|b| b.taken && b.start == addr) else {
            warn!("Free of unallocated address 0x{:08X}", addr);
            return false;
        };
        self.blocks[idx].taken = false;
        self.blocks[idx].tag.clear();

        // Merge with the next block, then the previous one.
        if idx + 1 < self.blocks.len() && !self.blocks[idx + 1].taken {
            let next = self.blocks.remove(idx + 1);
            self.blocks[idx].size += next.size;
        }
        if idx > 0 && !self.blocks[idx - 1].taken {
            let cur = self.blocks.remove(idx);
            self.blocks[idx - 1].size += cur.size;
        }
        true
    }

    /// Size of the block starting at `addr`, if allocated.
    pub fn block_size(&self, addr: PspAddr) -> Option<u32> {
        self.blocks
            .iter()
            .find(|b| b.taken && b.start == addr)
            .map(|b| b.size)
    }

    pub fn free_bytes(&self) -> u32 {
        self.blocks.iter().filter(|b| !b.taken).map(|b| b.size).sum()
    }

    pub fn contains(&self, addr: PspAddr) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}

impl Persist for BlockAllocator {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.section("BlockAllocator", 1, 1, |p, _| {
            p.sync(&mut self.start);
            p.sync(&mut self.size);
            p.sync(&mut self.grain);
            p.sync(&mut self.blocks);
        });
    }
}

// ---------------------------------------------------------------------------
// Memory system
// ---------------------------------------------------------------------------

/// RAM plus its two partitions, owned together so that stack helpers can
/// borrow all three at once.
pub struct MemorySystem {
    pub ram: GuestMemory,
    pub kernel: BlockAllocator,
    pub user: BlockAllocator,
}

impl MemorySystem {
    /// Standard PSP layout: 8 MiB kernel partition, 24 MiB user partition.
    pub fn new() -> MemoryResult<Self> {
        Ok(Self {
            ram: GuestMemory::new(PSP_RAM_BASE, PSP_RAM_SIZE)?,
            kernel: BlockAllocator::new(KERNEL_PARTITION_BASE, KERNEL_PARTITION_SIZE, ALLOC_GRAIN),
            user: BlockAllocator::new(USER_PARTITION_BASE, USER_PARTITION_SIZE, ALLOC_GRAIN),
        })
    }

    /// Pick the allocator that owns `addr`.
    pub fn allocator_for(&mut self, addr: PspAddr) -> &mut BlockAllocator {
        if self.kernel.contains(addr) {
            &mut self.kernel
        } else {
            &mut self.user
        }
    }
}

impl Persist for MemorySystem {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.section("Memory", 1, 1, |p, _| {
            p.sync(&mut self.ram);
            p.sync(&mut self.kernel);
            p.sync(&mut self.user);
        });
    }
}
