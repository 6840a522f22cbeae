// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use log::{debug, error};
use rupsp_common::chunk_file::SaveStateError;
use rupsp_common::settings::Settings;
use rupsp_common::{PointerWrap, PspAddr, SceUid};
use rupsp_cpu::state::{MIPS_REG_V0, MIPS_REG_V1};
use rupsp_cpu::MipsState;

use crate::handle_table::KernelObjectPool;
use crate::memory::{MemoryError, MemorySystem};
use crate::mips_call::{MipsCall, MipsCallManager};
use crate::scheduler::SchedulerState;
use crate::thread::Thread;
use crate::timing::CoreTiming;

/// Most diagnostics kept in [`KernelCore::reports`].
const MAX_REPORTS: usize = 256;

/// Interrupt controller flags seen by the thread manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptState {
    pub enabled: bool,
    pub in_interrupt: bool,
}

impl Default for InterruptState {
    fn default() -> Self {
        Self {
            enabled: true,
            in_interrupt: false,
        }
    }
}

bitflags! {
    /// Work deferred until the current syscall returns.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HleAfter: u32 {
        const RESCHED           = 1 << 0;
        const RESCHED_CALLBACKS = 1 << 1;
        const CURRENT_CALLBACKS = 1 << 2;
    }
}

/// Per-syscall bookkeeping.
#[derive(Debug, Default)]
pub struct HleState {
    pub after: HleAfter,
    pub resched_reason: &'static str,
    /// v0 was written explicitly, the entry point's value is ignored.
    pub return_set: bool,
}

/// Values a syscall entry point may produce for `v0`.
pub trait SyscallReturn {
    /// Raw register value, or `None` when the entry point sets its own.
    fn into_raw(self) -> Option<u32>;
}

impl SyscallReturn for () {
    fn into_raw(self) -> Option<u32> {
        None
    }
}

impl SyscallReturn for u32 {
    fn into_raw(self) -> Option<u32> {
        Some(self)
    }
}

impl SyscallReturn for i32 {
    fn into_raw(self) -> Option<u32> {
        Some(self as u32)
    }
}

impl SyscallReturn for rupsp_common::ResultCode {
    fn into_raw(self) -> Option<u32> {
        Some(self.raw())
    }
}

impl<T: SyscallReturn> SyscallReturn for Result<T, rupsp_common::ResultCode> {
    fn into_raw(self) -> Option<u32> {
        match self {
            Ok(v) => v.into_raw(),
            Err(rc) => Some(rc.raw()),
        }
    }
}

/// KernelCore: owns every piece of emulated state the thread manager
/// touches. Subsystems are plain fields so borrows stay disjoint.
pub struct KernelCore {
    pub objects: KernelObjectPool,
    pub memory: MemorySystem,
    /// Registers of the thread that is switched in.
    pub cpu: MipsState,
    pub timing: CoreTiming,
    pub settings: Settings,
    pub sched: SchedulerState,
    pub mips_calls: MipsCallManager,
    pub interrupts: InterruptState,
    pub hle: HleState,
    /// GP value of each loaded module.
    module_gp: BTreeMap<SceUid, u32>,
    reports: Vec<String>,
    reported_keys: BTreeSet<&'static str>,
}

impl KernelCore {
    /// Allocate guest RAM and set up threading. No thread is current until
    /// a module is booted.
    pub fn new(settings: Settings) -> Result<Self, MemoryError> {
        let mut kernel = Self {
            objects: KernelObjectPool::new(),
            memory: MemorySystem::new()?,
            cpu: MipsState::new(),
            timing: CoreTiming::new(),
            settings,
            sched: SchedulerState::new(),
            mips_calls: MipsCallManager::new(),
            interrupts: InterruptState::default(),
            hle: HleState::default(),
            module_gp: BTreeMap::new(),
            reports: Vec::new(),
            reported_keys: BTreeSet::new(),
        };
        kernel.init_threading();
        Ok(kernel)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Record an engine invariant violation. Never fatal.
    pub fn report(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        error!(target: "report", "{}", msg);
        if self.reports.len() < MAX_REPORTS {
            self.reports.push(msg);
        }
    }

    /// Like [`report`](Self::report), but only the first time for `key`.
    pub fn report_once(&mut self, key: &'static str, msg: impl Into<String>) {
        if self.reported_keys.insert(key) {
            self.report(msg);
        }
    }

    pub fn reports(&self) -> &[String] {
        &self.reports
    }

    // -----------------------------------------------------------------------
    // Syscall plumbing
    // -----------------------------------------------------------------------

    /// Run a syscall entry point, store its result in v0 and apply the
    /// deferred callback and reschedule requests it made.
    pub fn hle_call<R, F>(&mut self, name: &str, f: F)
    where
        R: SyscallReturn,
        F: FnOnce(&mut Self) -> R,
    {
        self.hle = HleState::default();
        let ret = f(self);
        if let Some(raw) = ret.into_raw() {
            if !self.hle.return_set {
                self.cpu.r[MIPS_REG_V0] = raw;
            }
            debug!("{} -> {:08x}", name, raw);
        }
        self.finish_syscall();
    }

    /// Apply what the last entry point asked for.
    pub fn finish_syscall(&mut self) {
        let after = std::mem::take(&mut self.hle.after);
        let reason = self.hle.resched_reason;

        if after.contains(HleAfter::CURRENT_CALLBACKS) && !after.contains(HleAfter::RESCHED_CALLBACKS) {
            self.force_callbacks();
        }
        if after.contains(HleAfter::RESCHED_CALLBACKS) {
            self.reschedule_with_callbacks(true, reason);
        } else if after.contains(HleAfter::RESCHED) {
            self.reschedule(reason);
        }
    }

    /// Write v0 now. Used before injecting calls that save v0.
    pub fn set_return(&mut self, value: u32) {
        self.cpu.r[MIPS_REG_V0] = value;
        self.hle.return_set = true;
    }

    pub fn hle_resched(&mut self, reason: &'static str) {
        self.hle.after |= HleAfter::RESCHED;
        self.hle.resched_reason = reason;
    }

    /// Reschedule after the syscall, letting the current thread run its
    /// callbacks if `callbacks` is set.
    pub fn hle_resched_cb(&mut self, callbacks: bool, reason: &'static str) {
        if callbacks {
            self.hle.after |= HleAfter::RESCHED_CALLBACKS;
        }
        self.hle_resched(reason);
    }

    pub fn hle_check_current_callbacks(&mut self) {
        self.hle.after |= HleAfter::CURRENT_CALLBACKS;
    }

    /// Charge the syscall's cost in CPU cycles.
    pub fn hle_eat_cycles(&mut self, cycles: u64) {
        self.timing.add_ticks(cycles);
    }

    /// Set the return registers of `thread_id`, live or saved. Inside a
    /// callback the value goes to the interrupted code instead.
    pub fn set_thread_return_value(&mut self, thread_id: SceUid, value: u32) {
        if thread_id == self.sched.current_thread {
            if self.sched.in_cb_count > 0 {
                if let Some(call) = self.active_call_mut(thread_id) {
                    call.set_return_value(value);
                }
            } else {
                self.cpu.r[MIPS_REG_V0] = value;
            }
        } else if let Ok(t) = self.objects.get_mut::<Thread>(thread_id) {
            t.context.r[MIPS_REG_V0] = value;
        }
    }

    pub fn set_thread_return_value_u64(&mut self, thread_id: SceUid, value: u64) {
        let (lo, hi) = (value as u32, (value >> 32) as u32);
        if thread_id == self.sched.current_thread {
            if self.sched.in_cb_count > 0 {
                if let Some(call) = self.active_call_mut(thread_id) {
                    call.set_return_value_u64(value);
                }
            } else {
                self.cpu.r[MIPS_REG_V0] = lo;
                self.cpu.r[MIPS_REG_V1] = hi;
            }
        } else if let Ok(t) = self.objects.get_mut::<Thread>(thread_id) {
            t.context.r[MIPS_REG_V0] = lo;
            t.context.r[MIPS_REG_V1] = hi;
        }
    }

    fn active_call_mut(&mut self, thread_id: SceUid) -> Option<&mut MipsCall> {
        let call_id = self.objects.get::<Thread>(thread_id).ok()?.current_mipscall_id;
        let call = self.mips_calls.get_mut(call_id);
        if call.is_none() {
            error!("Thread {} is in a callback without an active call", thread_id);
        }
        call
    }

    /// Fire every timed event that is due.
    pub fn advance_timing(&mut self) {
        while let Some((event_type, userdata, late)) = self.timing.pop_due() {
            match self.timing.callback(event_type) {
                Some(callback) => callback(self, userdata, late),
                None => self.report(format!(
                    "Timed event {} ({}) has no handler",
                    event_type,
                    self.timing.event_name(event_type)
                )),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Modules
    // -----------------------------------------------------------------------

    pub fn register_module_gp(&mut self, module_id: SceUid, gp: u32) {
        self.module_gp.insert(module_id, gp);
    }

    pub fn module_gp(&self, module_id: SceUid) -> u32 {
        self.module_gp.get(&module_id).copied().unwrap_or(0)
    }

    /// Start a module: idle threads become ready and a root thread starts
    /// at `entry` with `args` copied onto its stack.
    pub fn boot_module(&mut self, module_id: SceUid, entry: PspAddr, gp: u32, args: &[u8]) -> SceUid {
        self.register_module_gp(module_id, gp);
        self.start_idle_threads(module_id);
        self.cpu.pc = entry;
        let settings = &self.settings;
        let (prio, stack_size, attr) = (
            settings.root_thread_priority,
            settings.root_stack_size,
            settings.root_thread_attr,
        );
        self.setup_root_thread(module_id, args, prio, stack_size, attr)
    }

    // -----------------------------------------------------------------------
    // Savestates
    // -----------------------------------------------------------------------

    pub fn do_state(&mut self, p: &mut PointerWrap) {
        p.sync(&mut self.memory);
        p.sync(&mut self.timing);
        p.sync(&mut self.cpu);
        p.sync(&mut self.objects);
        self.do_state_threading(p);
        // Calls go last so every action type is registered by now.
        self.mips_calls.do_state(p);
        p.do_marker("sceKernelThread Late");
    }

    pub fn save_state(&mut self) -> Vec<u8> {
        let mut p = PointerWrap::writer();
        self.do_state(&mut p);
        p.into_bytes()
    }

    /// Replace all state with a snapshot.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SaveStateError> {
        let mut p = PointerWrap::reader(data);
        self.do_state(&mut p);
        p.finish_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::tmid;
    use crate::svc::callback::svc_notify_callback;
    use crate::svc::wait::svc_delay_thread;
    use crate::testing;
    use crate::thread::WaitType;

    #[test]
    fn test_save_load_mid_callback() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        testing::spawn(&mut k, "worker", 0x30);
        let cb = testing::create_callback(&mut k, "cb", 0x0880_2000);
        k.hle_call("notify", |k| svc_notify_callback(k, cb, 1));
        k.hle_call("delay", |k| svc_delay_thread(k, 5000, true));
        assert_eq!(k.cpu.pc, 0x0880_2000);

        let data = k.save_state();
        let mut restored = KernelCore::new(Settings::default()).unwrap();
        restored.load_state(&data).unwrap();

        assert_eq!(restored.sched.current_thread, root);
        assert_eq!(restored.cpu.pc, k.cpu.pc);
        assert_eq!(restored.sched.in_cb_count, 1);
        assert_eq!(restored.sched.paused_delays, k.sched.paused_delays);
        assert_eq!(
            restored.objects.list_ids(tmid::THREAD),
            k.objects.list_ids(tmid::THREAD)
        );
        assert_eq!(restored.current_thread().unwrap().name(), "root");

        // The restored call still unwinds into the paused delay.
        restored.cpu.r[MIPS_REG_V0] = 0;
        restored.return_from_mips_call();
        let t = restored.objects.get::<Thread>(root).unwrap();
        assert!(t.is_waiting_for(WaitType::Delay, root));
        assert_eq!(restored.sched.in_cb_count, 0);
        restored.idle();
        assert_eq!(restored.sched.current_thread, root);
    }

    #[test]
    fn test_save_load_mixed_thread_states() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let delayer = testing::spawn(&mut k, "delayer", 0x10);
        assert_eq!(k.sched.current_thread, delayer);
        k.hle_call("delay", |k| svc_delay_thread(k, 5000, false));
        assert_eq!(k.sched.current_thread, root);

        let a = testing::spawn(&mut k, "a", 0x30);
        let b = testing::spawn(&mut k, "b", 0x30);
        let dormant = k
            .create_thread_internal("dormant", testing::MODULE_ID, testing::THREAD_ENTRY, 0x40, 0x1000, 0)
            .unwrap();
        assert_eq!(k.sched.ready_queue.threads_at(0x30), vec![a, b]);

        let data = k.save_state();
        let mut restored = KernelCore::new(Settings::default()).unwrap();
        restored.load_state(&data).unwrap();

        let snapshot = |k: &KernelCore, id: SceUid| {
            let t = k.objects.get::<Thread>(id).unwrap();
            (
                t.nt.status,
                t.nt.current_priority,
                t.nt.wait_type,
                t.nt.wait_id,
                t.wait_info,
            )
        };
        for id in k.objects.list_ids(tmid::THREAD) {
            assert_eq!(snapshot(&restored, id), snapshot(&k, id), "thread {}", id);
        }
        assert!(restored.objects.get::<Thread>(root).unwrap().is_running());
        assert!(restored.objects.get::<Thread>(dormant).unwrap().is_dormant());
        assert!(restored.objects.get::<Thread>(delayer).unwrap().is_waiting_for(WaitType::Delay, delayer));
        assert_eq!(restored.sched.ready_queue, k.sched.ready_queue);
        assert_eq!(restored.sched.ready_queue.threads_at(0x30), vec![a, b]);
        assert_eq!(restored.sched.current_thread, root);
        assert_eq!(restored.current_thread().unwrap().name(), "root");

        let wakeup = k.sched.event_scheduled_wakeup;
        let due = k.timing.event_time(wakeup, delayer as u64);
        assert!(due.is_some());
        assert_eq!(restored.timing.event_time(restored.sched.event_scheduled_wakeup, delayer as u64), due);
    }

    #[test]
    fn test_load_truncated_state_fails() {
        let mut k = testing::boot();
        let data = k.save_state();
        let mut restored = KernelCore::new(Settings::default()).unwrap();
        assert!(restored.load_state(&data[..data.len() / 2]).is_err());
    }
}
