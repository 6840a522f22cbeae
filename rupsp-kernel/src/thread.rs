// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! PSP thread entity: native status block, register context and stacks.

use std::collections::{BTreeMap, VecDeque};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, warn};
use rupsp_common::{error, Persist, PointerWrap, PspAddr, SceUid};
use rupsp_cpu::state::{
    vfpu_ctrl, vfpu_offset_table, MIPS_REG_K0, MIPS_REG_SP, NUM_VFPU_CTRL, NUM_VFPU_REGS,
};
use rupsp_cpu::{MemoryAccess, MemoryFault, MipsState};

use crate::memory::MemorySystem;

/// Priority range user code may request.
pub const THREAD_PRIORITY_HIGHEST: u32 = 0x08;
pub const THREAD_PRIORITY_LOWEST: u32 = 0x77;
/// Priority of the idle threads.
pub const IDLE_THREAD_PRIORITY: u32 = 0x7f;

/// Smallest stack sceKernelCreateThread accepts.
pub const MIN_STACK_SIZE: u32 = 0x200;

/// Size of the k0 block reserved at the top of every stack.
const K0_BLOCK_SIZE: u32 = 0x100;

/// Size of `NativeThread` as the guest sees it.
pub const NATIVE_THREAD_SIZE: usize = 108;
/// Size reported to modules built against SDK 2.60 or older.
pub const NATIVE_THREAD_SIZE_OLD: usize = 104;
/// Size of `SceKernelThreadRunStatus`.
pub const THREAD_RUN_STATUS_SIZE: usize = 44;

bitflags! {
    /// Thread status bits. Exactly one primary state is set at a time,
    /// except that SUSPEND may combine with WAIT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadStatus: u32 {
        const RUNNING = 1;
        const READY   = 2;
        const WAIT    = 4;
        const SUSPEND = 8;
        const DORMANT = 16;
        const DEAD    = 32;

        const WAITSUSPEND = Self::WAIT.bits() | Self::SUSPEND.bits();
    }
}

bitflags! {
    /// Thread attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadAttr: u32 {
        const KERNEL       = 0x0000_1000;
        const VFPU         = 0x0000_4000;
        const SCRATCH_SRAM = 0x0000_8000;
        const NO_FILLSTACK = 0x0010_0000;
        const CLEAR_STACK  = 0x0020_0000;
        const LOW_STACK    = 0x0040_0000;
        const USER         = 0x8000_0000;
        const USBWLAN      = 0xa000_0000;
        const VSH          = 0xc000_0000;
    }
}

impl ThreadAttr {
    /// Bits user code may pass at all.
    pub const USER_MASK: u32 = 0xf8f0_60ff;
    /// Bits silently dropped from user requests.
    pub const USER_ERASE: u32 = 0x7880_0000;
    /// Bits the emulation understands.
    pub const SUPPORTED: u32 = Self::KERNEL.bits()
        | Self::VFPU.bits()
        | Self::NO_FILLSTACK.bits()
        | Self::CLEAR_STACK.bits()
        | Self::LOW_STACK.bits()
        | Self::USER.bits();
}

/// What a waiting thread is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum WaitType {
    #[default]
    None = 0,
    Sleep = 1,
    Delay = 2,
    Sema = 3,
    EventFlag = 4,
    Mbx = 5,
    Vpl = 6,
    Fpl = 7,
    MsgPipe = 8,
    ThreadEnd = 9,
    AudioChannel = 10,
    Umd = 11,
    Vblank = 12,
    Mutex = 13,
    LwMutex = 14,
    Ctrl = 15,
    Io = 16,
    GeDrawSync = 17,
    GeListSync = 18,
    Module = 19,
    HleDelay = 20,
    Tlspl = 21,
    Vmem = 22,
    AsyncIo = 23,
}

/// Number of wait types.
pub const NUM_WAITTYPES: usize = 24;

impl WaitType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Sleep,
            2 => Self::Delay,
            3 => Self::Sema,
            4 => Self::EventFlag,
            5 => Self::Mbx,
            6 => Self::Vpl,
            7 => Self::Fpl,
            8 => Self::MsgPipe,
            9 => Self::ThreadEnd,
            10 => Self::AudioChannel,
            11 => Self::Umd,
            12 => Self::Vblank,
            13 => Self::Mutex,
            14 => Self::LwMutex,
            15 => Self::Ctrl,
            16 => Self::Io,
            17 => Self::GeDrawSync,
            18 => Self::GeListSync,
            19 => Self::Module,
            20 => Self::HleDelay,
            21 => Self::Tlspl,
            22 => Self::Vmem,
            23 => Self::AsyncIo,
            _ => {
                warn!("Unknown wait type {}", raw);
                Self::None
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sleep => "Sleep",
            Self::Delay => "Delay",
            Self::Sema => "Semaphore",
            Self::EventFlag => "Event flag",
            Self::Mbx => "MBX",
            Self::Vpl => "VPL",
            Self::Fpl => "FPL",
            Self::MsgPipe => "Message pipe",
            Self::ThreadEnd => "Thread end",
            Self::AudioChannel => "Audio channel",
            Self::Umd => "UMD",
            Self::Vblank => "VBlank",
            Self::Mutex => "Mutex",
            Self::LwMutex => "LwMutex",
            Self::Ctrl => "Control",
            Self::Io => "IO",
            Self::GeDrawSync => "GeDrawSync",
            Self::GeListSync => "GeListSync",
            Self::Module => "Module",
            Self::HleDelay => "HleDelay",
            Self::Tlspl => "TLS",
            Self::Vmem => "Volatile Mem",
            Self::AsyncIo => "AsyncIO",
        }
    }
}

// ---------------------------------------------------------------------------
// Register context
// ---------------------------------------------------------------------------

/// Saved register file of a thread that is not switched in.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadContext {
    pub r: [u32; 32],
    pub f: [u32; 32],
    pub v: [u32; NUM_VFPU_REGS],
    pub vfpu_ctrl: [u32; NUM_VFPU_CTRL],
    pub pc: u32,
    pub hi: u32,
    pub lo: u32,
    pub fpcond: u32,
    pub fcr31: u32,
}

impl Default for ThreadContext {
    fn default() -> Self {
        let mut ctx = Self {
            r: [0; 32],
            f: [0; 32],
            v: [0; NUM_VFPU_REGS],
            vfpu_ctrl: [0; NUM_VFPU_CTRL],
            pc: 0,
            hi: 0,
            lo: 0,
            fpcond: 0,
            fcr31: 0,
        };
        ctx.reset();
        ctx
    }
}

impl ThreadContext {
    /// Poison every register so reads of uninitialized state are visible.
    pub fn reset(&mut self) {
        self.r = [0xDEAD_BEEF; 32];
        self.r[0] = 0;
        self.f = [0x7f80_0001; 32];
        self.v = [0x7f80_0001; NUM_VFPU_REGS];
        self.vfpu_ctrl = [0; NUM_VFPU_CTRL];
        self.vfpu_ctrl[vfpu_ctrl::SPREFIX] = 0xe4;
        self.vfpu_ctrl[vfpu_ctrl::TPREFIX] = 0xe4;
        self.vfpu_ctrl[vfpu_ctrl::DPREFIX] = 0;
        self.vfpu_ctrl[vfpu_ctrl::CC] = 0x3f;
        self.vfpu_ctrl[vfpu_ctrl::INF4] = 0;
        self.vfpu_ctrl[vfpu_ctrl::REV] = 0x7772_ceab;
        self.vfpu_ctrl[vfpu_ctrl::RCX0] = 0x3f80_0001;
        self.vfpu_ctrl[vfpu_ctrl::RCX1] = 0x3f80_0002;
        self.vfpu_ctrl[vfpu_ctrl::RCX2] = 0x3f80_0004;
        self.vfpu_ctrl[vfpu_ctrl::RCX3] = 0x3f80_0008;
        for i in vfpu_ctrl::RCX4..=vfpu_ctrl::RCX7 {
            self.vfpu_ctrl[i] = 0x3f80_0000;
        }
        self.fpcond = 0;
        self.fcr31 = 0x0000_0e00;
        self.hi = 0xDEAD_BEEF;
        self.lo = 0xDEAD_BEEF;
    }

    /// Copy the live CPU registers into this context.
    pub fn save_from(&mut self, cpu: &MipsState, vfpu: bool) {
        self.r = cpu.r;
        self.f = cpu.f;
        if vfpu {
            self.v = cpu.v;
            self.vfpu_ctrl = cpu.vfpu_ctrl;
        }
        self.pc = cpu.pc;
        self.hi = cpu.hi;
        self.lo = cpu.lo;
        self.fcr31 = cpu.fcr31;
        self.fpcond = cpu.fpcond;
    }

    /// Load this context into the live CPU.
    pub fn load_into(&self, cpu: &mut MipsState, vfpu: bool) {
        cpu.r = self.r;
        cpu.f = self.f;
        if vfpu {
            cpu.v = self.v;
            cpu.vfpu_ctrl = self.vfpu_ctrl;
        }
        cpu.pc = self.pc;
        cpu.hi = self.hi;
        cpu.lo = self.lo;
        cpu.fcr31 = self.fcr31;
        cpu.fpcond = self.fpcond;
        cpu.ll_bit = false;
    }

    /// Serialize using the layout of section version `version`.
    fn do_state(&mut self, p: &mut PointerWrap, version: u32) {
        p.sync(&mut self.r);
        p.sync(&mut self.f);
        p.sync(&mut self.v);
        p.sync(&mut self.vfpu_ctrl);
        let mut other = [self.pc, self.lo, self.hi, self.fcr31, self.fpcond, 0];
        p.sync(&mut other);
        if p.is_reading() {
            self.apply_legacy_fixups(&mut other, version);
            [self.pc, self.lo, self.hi, self.fcr31, self.fpcond] =
                [other[0], other[1], other[2], other[3], other[4]];
        }
    }

    /// Convert a context loaded from an older state to the current layout.
    fn apply_legacy_fixups(&mut self, other: &mut [u32; 6], version: u32) {
        if version <= 3 {
            let table = vfpu_offset_table();
            let old = self.v;
            for (i, &value) in old.iter().enumerate() {
                self.v[table[i]] = value;
            }
        }
        if version <= 2 {
            other[4] = other[5];
            other[3] = other[4];
        }
        if version <= 4 {
            other.swap(1, 2);
        }
    }
}

// ---------------------------------------------------------------------------
// Native structures
// ---------------------------------------------------------------------------

/// Store a name as a NUL-terminated 32-byte field.
pub(crate) fn name_to_bytes(name: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = name.as_bytes();
    let n = bytes.len().min(rupsp_common::KERNELOBJECT_MAX_NAME_LENGTH);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Read a NUL-terminated 32-byte name field.
pub(crate) fn name_from_bytes(bytes: &[u8; 32]) -> &str {
    let n = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..n]).unwrap_or("")
}

/// Guest-visible thread status block (`SceKernelThreadInfo`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeThread {
    pub native_size: u32,
    pub name: [u8; 32],
    pub attr: u32,
    pub status: ThreadStatus,
    pub entrypoint: PspAddr,
    pub initial_stack: PspAddr,
    pub stack_size: u32,
    pub gpreg: u32,
    pub initial_priority: u32,
    pub current_priority: u32,
    pub wait_type: WaitType,
    pub wait_id: SceUid,
    pub wakeup_count: i32,
    pub exit_status: u32,
    pub run_for_clocks: u64,
    pub num_interrupt_preempts: i32,
    pub num_thread_preempts: i32,
    pub num_releases: i32,
}

impl Default for NativeThread {
    fn default() -> Self {
        Self {
            native_size: NATIVE_THREAD_SIZE as u32,
            name: [0; 32],
            attr: 0,
            status: ThreadStatus::DORMANT,
            entrypoint: 0,
            initial_stack: 0,
            stack_size: 0,
            gpreg: 0,
            initial_priority: 0,
            current_priority: 0,
            wait_type: WaitType::None,
            wait_id: 0,
            wakeup_count: 0,
            exit_status: error::DORMANT.raw(),
            run_for_clocks: 0,
            num_interrupt_preempts: 0,
            num_thread_preempts: 0,
            num_releases: 0,
        }
    }
}

impl NativeThread {
    pub fn to_bytes(&self) -> [u8; NATIVE_THREAD_SIZE] {
        let mut b = [0u8; NATIVE_THREAD_SIZE];
        LittleEndian::write_u32(&mut b[0..], self.native_size);
        b[4..36].copy_from_slice(&self.name);
        LittleEndian::write_u32(&mut b[36..], self.attr);
        LittleEndian::write_u32(&mut b[40..], self.status.bits());
        LittleEndian::write_u32(&mut b[44..], self.entrypoint);
        LittleEndian::write_u32(&mut b[48..], self.initial_stack);
        LittleEndian::write_u32(&mut b[52..], self.stack_size);
        LittleEndian::write_u32(&mut b[56..], self.gpreg);
        LittleEndian::write_u32(&mut b[60..], self.initial_priority);
        LittleEndian::write_u32(&mut b[64..], self.current_priority);
        LittleEndian::write_u32(&mut b[68..], self.wait_type as u32);
        LittleEndian::write_i32(&mut b[72..], self.wait_id);
        LittleEndian::write_i32(&mut b[76..], self.wakeup_count);
        LittleEndian::write_u32(&mut b[80..], self.exit_status);
        LittleEndian::write_u64(&mut b[84..], self.run_for_clocks);
        LittleEndian::write_i32(&mut b[92..], self.num_interrupt_preempts);
        LittleEndian::write_i32(&mut b[96..], self.num_thread_preempts);
        LittleEndian::write_i32(&mut b[100..], self.num_releases);
        b
    }

    pub fn from_bytes(b: &[u8; NATIVE_THREAD_SIZE]) -> Self {
        let mut name = [0u8; 32];
        name.copy_from_slice(&b[4..36]);
        Self {
            native_size: LittleEndian::read_u32(&b[0..]),
            name,
            attr: LittleEndian::read_u32(&b[36..]),
            status: ThreadStatus::from_bits_retain(LittleEndian::read_u32(&b[40..])),
            entrypoint: LittleEndian::read_u32(&b[44..]),
            initial_stack: LittleEndian::read_u32(&b[48..]),
            stack_size: LittleEndian::read_u32(&b[52..]),
            gpreg: LittleEndian::read_u32(&b[56..]),
            initial_priority: LittleEndian::read_u32(&b[60..]),
            current_priority: LittleEndian::read_u32(&b[64..]),
            wait_type: WaitType::from_raw(LittleEndian::read_u32(&b[68..])),
            wait_id: LittleEndian::read_i32(&b[72..]),
            wakeup_count: LittleEndian::read_i32(&b[76..]),
            exit_status: LittleEndian::read_u32(&b[80..]),
            run_for_clocks: LittleEndian::read_u64(&b[84..]),
            num_interrupt_preempts: LittleEndian::read_i32(&b[92..]),
            num_thread_preempts: LittleEndian::read_i32(&b[96..]),
            num_releases: LittleEndian::read_i32(&b[100..]),
        }
    }

    /// `SceKernelThreadRunStatus` view of this thread.
    pub fn run_status_bytes(&self) -> [u8; THREAD_RUN_STATUS_SIZE] {
        let mut b = [0u8; THREAD_RUN_STATUS_SIZE];
        LittleEndian::write_u32(&mut b[0..], THREAD_RUN_STATUS_SIZE as u32);
        LittleEndian::write_u32(&mut b[4..], self.status.bits());
        LittleEndian::write_u32(&mut b[8..], self.current_priority);
        LittleEndian::write_u32(&mut b[12..], self.wait_type as u32);
        LittleEndian::write_i32(&mut b[16..], self.wait_id);
        LittleEndian::write_i32(&mut b[20..], self.wakeup_count);
        LittleEndian::write_u64(&mut b[24..], self.run_for_clocks);
        LittleEndian::write_i32(&mut b[32..], self.num_interrupt_preempts);
        LittleEndian::write_i32(&mut b[36..], self.num_thread_preempts);
        LittleEndian::write_i32(&mut b[40..], self.num_releases);
        b
    }
}

impl Persist for NativeThread {
    fn persist(&mut self, p: &mut PointerWrap) {
        let mut raw = self.to_bytes();
        p.do_bytes(&mut raw);
        if p.is_reading() {
            *self = Self::from_bytes(&raw);
        }
    }
}

/// Extra wait data: a wait-type specific value and the guest timeout pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadWaitInfo {
    pub wait_value: u32,
    pub timeout_ptr: PspAddr,
}

impl Persist for ThreadWaitInfo {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.sync(&mut self.wait_value);
        p.sync(&mut self.timeout_ptr);
    }
}

/// A stack range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackInfo {
    pub start: PspAddr,
    pub end: PspAddr,
}

impl Persist for StackInfo {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.sync(&mut self.start);
        p.sync(&mut self.end);
    }
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Thread {
    pub uid: SceUid,
    pub nt: NativeThread,
    pub wait_info: ThreadWaitInfo,
    /// Module that created this thread.
    pub module_id: SceUid,
    /// Set while blocked in a `*CB` wait, allowing callbacks to run.
    pub is_processing_callbacks: bool,
    /// MIPS call currently running on top of this thread, 0 if none.
    pub current_mipscall_id: u32,
    pub current_callback_id: SceUid,
    pub context: ThreadContext,
    /// Owned callbacks.
    pub callbacks: Vec<SceUid>,
    /// MIPS calls to run when this thread is next switched in.
    pub pending_mips_calls: VecDeque<u32>,
    /// Stacks saved by `sceKernelExtendThreadStack`.
    pub pushed_stacks: Vec<StackInfo>,
    pub current_stack: StackInfo,
    /// Threads blocked in WaitThreadEnd on this thread.
    pub waiting_threads: Vec<SceUid>,
    /// Paused thread-end wait deadlines, keyed by callback or thread ID.
    pub paused_waits: BTreeMap<SceUid, u64>,
}

impl Thread {
    pub fn new(
        name: &str,
        module_id: SceUid,
        entrypoint: PspAddr,
        priority: u32,
        attr: u32,
    ) -> Self {
        let mut t = Self {
            module_id,
            ..Self::default()
        };
        t.nt.name = name_to_bytes(name);
        t.nt.attr = attr;
        t.nt.entrypoint = entrypoint;
        t.nt.initial_priority = priority;
        t.nt.current_priority = priority;
        t.nt.status = ThreadStatus::DORMANT;
        t.nt.exit_status = error::DORMANT.raw();
        t.context.reset();
        t
    }

    pub fn name(&self) -> &str {
        name_from_bytes(&self.nt.name)
    }

    pub fn attr(&self) -> ThreadAttr {
        ThreadAttr::from_bits_retain(self.nt.attr)
    }

    pub fn is_kernel(&self) -> bool {
        self.attr().contains(ThreadAttr::KERNEL)
    }

    pub fn uses_vfpu(&self) -> bool {
        self.attr().contains(ThreadAttr::VFPU)
    }

    pub fn is_running(&self) -> bool {
        self.nt.status.contains(ThreadStatus::RUNNING)
    }

    pub fn is_ready(&self) -> bool {
        self.nt.status.contains(ThreadStatus::READY)
    }

    pub fn is_waiting(&self) -> bool {
        self.nt.status.contains(ThreadStatus::WAIT)
    }

    pub fn is_suspended(&self) -> bool {
        self.nt.status.contains(ThreadStatus::SUSPEND)
    }

    pub fn is_dormant(&self) -> bool {
        self.nt.status.contains(ThreadStatus::DORMANT)
    }

    pub fn is_dead(&self) -> bool {
        self.nt.status.contains(ThreadStatus::DEAD)
    }

    /// Dormant or dead.
    pub fn is_stopped(&self) -> bool {
        self.nt
            .status
            .intersects(ThreadStatus::DORMANT | ThreadStatus::DEAD)
    }

    pub fn is_waiting_for(&self, wait_type: WaitType, id: SceUid) -> bool {
        self.is_waiting() && self.nt.wait_type == wait_type && self.nt.wait_id == id
    }

    /// Wait target if waiting on `wait_type`, else 0.
    pub fn wait_id(&self, wait_type: WaitType) -> SceUid {
        if self.nt.wait_type == wait_type {
            self.nt.wait_id
        } else {
            0
        }
    }

    fn stack_tag(&self, prefix: &str) -> String {
        format!("{}/{}", prefix, self.name())
    }

    /// Allocate the primary stack. The size is rounded up to the allocator
    /// grain and stored back in `nt.stack_size`.
    pub fn allocate_stack(&mut self, mem: &mut MemorySystem, stack_size: u32) -> bool {
        if stack_size < MIN_STACK_SIZE {
            error!("Thread stack should be at least {:#X} bytes", MIN_STACK_SIZE);
        }
        self.free_stack(mem);

        let from_top = !self.attr().contains(ThreadAttr::LOW_STACK);
        let tag = self.stack_tag("stack");
        let allocator = if self.is_kernel() {
            &mut mem.kernel
        } else {
            &mut mem.user
        };
        let Some(start) = allocator.alloc(stack_size, from_top, &tag) else {
            self.current_stack.start = 0;
            self.nt.initial_stack = 0;
            error!("Failed to allocate stack for thread {}", self.name());
            return false;
        };

        let size = allocator.block_size(start).unwrap_or(stack_size);
        self.current_stack.start = start;
        self.current_stack.end = start + size;
        self.nt.initial_stack = start;
        self.nt.stack_size = size;
        true
    }

    /// Prepare the stack for a fresh start: fill it, reserve the k0 block
    /// at the top and point sp/k0 at it.
    pub fn fill_stack(&mut self, mem: &mut MemorySystem) -> Result<(), MemoryFault> {
        if !self.attr().contains(ThreadAttr::NO_FILLSTACK) {
            mem.ram
                .memset(self.current_stack.start, 0xFF, self.nt.stack_size)?;
        }
        let top = self.current_stack.start + self.nt.stack_size;
        self.current_stack.end = top;
        let k0 = top - K0_BLOCK_SIZE;
        self.context.r[MIPS_REG_SP] = k0;
        self.context.r[MIPS_REG_K0] = k0;

        let uid = self.uid as u32;
        mem.ram.memset(k0, 0, K0_BLOCK_SIZE)?;
        mem.ram.write_u32(k0 + 0xc0, uid)?;
        mem.ram.write_u32(k0 + 0xc8, self.nt.initial_stack)?;
        mem.ram.write_u32(k0 + 0xf8, 0xffff_ffff)?;
        mem.ram.write_u32(k0 + 0xfc, 0xffff_ffff)?;
        // Arguments go right under k0, written by the start path.
        mem.ram.write_u32(self.nt.initial_stack, uid)
    }

    /// Release the primary stack, clearing it first if requested.
    pub fn free_stack(&mut self, mem: &mut MemorySystem) {
        if self.current_stack.start == 0 {
            return;
        }
        debug!("Freeing thread stack {}", self.name());
        if self.attr().contains(ThreadAttr::CLEAR_STACK) {
            if let Err(e) = mem.ram.memset(self.nt.initial_stack, 0, self.nt.stack_size) {
                warn!("Could not clear stack of {}: {}", self.name(), e);
            }
        }
        let start = self.current_stack.start;
        if self.is_kernel() {
            mem.kernel.free(start);
        } else {
            mem.user.free(start);
        }
        self.current_stack.start = 0;
    }

    /// Switch to a new stack of `size` bytes, remembering the current one.
    pub fn push_extended_stack(&mut self, mem: &mut MemorySystem, size: u32) -> bool {
        let tag = self.stack_tag("extended");
        let Some(stack) = mem.user.alloc(size, true, &tag) else {
            return false;
        };
        self.pushed_stacks.push(self.current_stack);
        self.current_stack = StackInfo {
            start: stack,
            end: stack + size,
        };
        self.nt.initial_stack = stack;
        self.nt.stack_size = size;

        // Thread ID at the bottom, but no k0 block.
        let uid = self.uid as u32;
        let filled = mem
            .ram
            .memset(stack, 0xFF, size)
            .and_then(|_| mem.ram.write_u32(stack, uid));
        if let Err(e) = filled {
            warn!("Could not initialize extended stack: {}", e);
        }
        true
    }

    /// Return to the previous stack, freeing the extended one.
    pub fn pop_extended_stack(&mut self, mem: &mut MemorySystem) -> bool {
        let Some(previous) = self.pushed_stacks.pop() else {
            return false;
        };
        mem.user.free(self.current_stack.start);
        self.current_stack = previous;
        self.nt.initial_stack = previous.start;
        self.nt.stack_size = previous.end - previous.start;
        true
    }

    /// Serialize as a "Thread" section.
    pub fn do_state(&mut self, p: &mut PointerWrap) {
        p.section("Thread", 1, 5, |p, version| {
            p.sync(&mut self.nt);
            p.sync(&mut self.wait_info);
            p.sync(&mut self.module_id);
            p.sync(&mut self.is_processing_callbacks);
            p.sync(&mut self.current_mipscall_id);
            p.sync(&mut self.current_callback_id);
            self.context.do_state(p, version);
            p.sync(&mut self.callbacks);
            p.sync(&mut self.pending_mips_calls);
            p.sync(&mut self.pushed_stacks);
            p.sync(&mut self.current_stack);
            if version >= 2 {
                p.sync(&mut self.waiting_threads);
                p.sync(&mut self.paused_waits);
            }
        });
    }
}
