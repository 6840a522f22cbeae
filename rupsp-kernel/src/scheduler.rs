// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Priority scheduler.
//! Picks the best ready thread, switches register contexts and owns the
//! process-wide threading state (ready queue, idle threads, dispatch flag,
//! callback nesting and the wait-type hook table).

use std::collections::BTreeMap;

use log::{debug, error};
use rupsp_common::{cycles_to_us, PointerWrap, PspAddr, SceUid};
use rupsp_cpu::state::MIPS_REG_GP;

use crate::kernel::KernelCore;
use crate::mips_call::{ActionAfterCallback, ActionAfterMipsCall};
use crate::thread::{Thread, ThreadStatus, WaitType, NUM_WAITTYPES};
use crate::thread_queue::ThreadQueueList;
use crate::timing::EventType;
use crate::wait;

/// Cycles charged for a switch between two real threads.
const SWITCH_COST: u64 = 2700;
/// Cycles charged when one side of the switch is an idle thread.
const SWITCH_COST_IDLE: u64 = 1200;

/// Hook run when a callback interrupts (begin) or resumes (end) a wait:
/// `(kernel, thread_id, prev_callback_id)`.
pub type WaitCallbackFn = fn(&mut KernelCore, SceUid, SceUid);

/// Called with the ID of every thread that stops.
pub type ThreadEndListener = fn(&mut KernelCore, SceUid);

#[derive(Clone, Copy)]
pub struct WaitTypeFuncs {
    pub begin: WaitCallbackFn,
    pub end: WaitCallbackFn,
}

/// Guest addresses of the kernel trampolines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HackAddresses {
    pub idle: PspAddr,
    pub thread_return: PspAddr,
    pub callback_return: PspAddr,
    pub interrupt_return: PspAddr,
    pub extend_return: PspAddr,
    pub module_return: PspAddr,
}

/// Process-wide threading state.
pub struct SchedulerState {
    /// Thread whose registers are live in the CPU, 0 if none.
    pub current_thread: SceUid,
    pub ready_queue: ThreadQueueList,
    /// Every thread, in creation order.
    pub all_threads: Vec<SceUid>,
    pub idle_threads: [SceUid; 2],
    pub dispatch_enabled: bool,

    /// Nesting depth of running callbacks.
    pub in_cb_count: i32,
    pub current_callback_thread: SceUid,
    /// Number of callbacks with a nonzero notify count.
    pub ready_callbacks_count: i32,

    pub hacks: HackAddresses,
    pub event_scheduled_wakeup: EventType,
    pub event_thread_end_timeout: EventType,
    pub action_after_mips_call: i32,
    pub action_after_callback: i32,

    /// Delay deadlines paused while a callback runs, keyed by callback or
    /// thread ID.
    pub paused_delays: BTreeMap<SceUid, u64>,
    /// Event handlers by thread ID (or the all-user wildcard).
    pub thread_event_handlers: BTreeMap<SceUid, Vec<SceUid>>,
    /// Deleted threads kept alive until their DELETE handlers return.
    pub pending_delete_threads: Vec<SceUid>,

    pub wait_type_funcs: [Option<WaitTypeFuncs>; NUM_WAITTYPES],
    pub thread_end_listeners: Vec<ThreadEndListener>,
    pub registered_exit_cb: SceUid,
    pub last_switch_cycles: u64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            current_thread: 0,
            ready_queue: ThreadQueueList::new(),
            all_threads: Vec::new(),
            idle_threads: [0; 2],
            dispatch_enabled: true,
            in_cb_count: 0,
            current_callback_thread: 0,
            ready_callbacks_count: 0,
            hacks: HackAddresses::default(),
            event_scheduled_wakeup: -1,
            event_thread_end_timeout: -1,
            action_after_mips_call: 0,
            action_after_callback: 0,
            paused_delays: BTreeMap::new(),
            thread_event_handlers: BTreeMap::new(),
            pending_delete_threads: Vec::new(),
            wait_type_funcs: [None; NUM_WAITTYPES],
            thread_end_listeners: Vec::new(),
            registered_exit_cb: 0,
            last_switch_cycles: 0,
        }
    }

    pub fn is_idle(&self, id: SceUid) -> bool {
        id != 0 && self.idle_threads.contains(&id)
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep ready-queue membership in step with the READY bit.
///
/// A running thread that becomes ready goes to the front of its bucket so
/// that it keeps its turn.
pub(crate) fn update_ready_queue(queue: &mut ThreadQueueList, thread: &mut Thread, ready: bool) {
    let prio = thread.nt.current_priority;
    if thread.is_ready() {
        if !ready {
            queue.remove(prio, thread.uid);
        }
    } else if ready {
        if thread.is_running() {
            queue.push_front(prio, thread.uid);
        } else {
            queue.push_back(prio, thread.uid);
        }
        thread.nt.status = ThreadStatus::READY;
    }
}

impl KernelCore {
    pub fn current_thread(&self) -> Option<&Thread> {
        self.objects.get::<Thread>(self.sched.current_thread).ok()
    }

    pub fn current_thread_mut(&mut self) -> Option<&mut Thread> {
        self.objects.get_mut::<Thread>(self.sched.current_thread).ok()
    }

    /// Dispatch is on and interrupts are enabled.
    pub fn is_dispatch_enabled(&self) -> bool {
        self.sched.dispatch_enabled && self.interrupts.enabled
    }

    pub fn change_ready_state(&mut self, thread_id: SceUid, ready: bool) {
        if let Ok(thread) = self.objects.get_mut::<Thread>(thread_id) {
            update_ready_queue(&mut self.sched.ready_queue, thread, ready);
        }
    }

    /// Move a thread to a new status, keeping the ready queue in sync.
    pub fn change_thread_state(&mut self, thread_id: SceUid, new_status: ThreadStatus) {
        let dispatch_enabled = self.sched.dispatch_enabled;
        let is_current = thread_id == self.sched.current_thread;
        let Ok(thread) = self.objects.get_mut::<Thread>(thread_id) else {
            return;
        };
        if thread.nt.status == new_status {
            return;
        }
        if !dispatch_enabled && is_current && new_status != ThreadStatus::RUNNING {
            error!("Dispatching suspended, not changing thread state");
            return;
        }
        update_ready_queue(
            &mut self.sched.ready_queue,
            thread,
            new_status.contains(ThreadStatus::READY),
        );
        thread.nt.status = new_status;
    }

    /// Best thread to run next, or 0 to keep the current one.
    fn next_thread(&mut self) -> SceUid {
        let cur = self
            .current_thread()
            .filter(|t| t.is_running())
            .map(|t| (t.uid, t.nt.current_priority));

        match cur {
            Some((cur_id, prio)) => {
                let best = self.sched.ready_queue.pop_first_better(prio);
                if best != 0 {
                    self.change_ready_state(cur_id, true);
                }
                best
            }
            None => {
                let best = self.sched.ready_queue.pop_first();
                if best != 0 {
                    return best;
                }
                self.report_once(
                    "thread-queue-empty",
                    "No thread to schedule, falling back to idle thread",
                );
                self.sched.idle_threads[1]
            }
        }
    }

    /// Run ready callbacks, fire due events and switch to the best thread.
    pub fn reschedule(&mut self, reason: &str) {
        self.check_callbacks();
        self.advance_timing();

        // Threads never change inside interrupts or with dispatch off.
        if self.interrupts.in_interrupt || !self.is_dispatch_enabled() {
            return;
        }

        let next = self.next_thread();
        if next != 0 && self.objects.get::<Thread>(next).is_ok() {
            self.switch_context(next, reason);
        }
    }

    /// Reschedule, letting the current thread process callbacks while it
    /// waits.
    pub fn reschedule_with_callbacks(&mut self, do_callbacks: bool, reason: &str) {
        let thread_id = self.sched.current_thread;
        if do_callbacks {
            if let Some(t) = self.current_thread_mut() {
                t.is_processing_callbacks = true;
            }
        }

        self.reschedule(reason);

        if do_callbacks && thread_id == self.sched.current_thread {
            if let Some(t) = self.current_thread_mut() {
                if t.is_running() {
                    t.is_processing_callbacks = false;
                }
            }
        }
    }

    /// Save the current thread and load `target`.
    pub fn switch_context(&mut self, target: SceUid, reason: &str) {
        let old_pc = self.cpu.pc;
        let old_uid = self.sched.current_thread;

        if let Ok(cur) = self.objects.get_mut::<Thread>(old_uid) {
            let vfpu = cur.uses_vfpu();
            cur.context.save_from(&self.cpu, vfpu);
            if cur.is_running() {
                update_ready_queue(&mut self.sched.ready_queue, cur, true);
            }
        }

        match self.objects.get_mut::<Thread>(target) {
            Ok(t) => {
                self.sched.current_thread = target;
                update_ready_queue(&mut self.sched.ready_queue, t, false);
                t.nt.status = (t.nt.status | ThreadStatus::RUNNING) - ThreadStatus::READY;
                let vfpu = t.uses_vfpu();
                t.context.load_into(&mut self.cpu, vfpu);
            }
            Err(_) => self.sched.current_thread = 0,
        }

        let new_uid = self.sched.current_thread;
        let from_idle = self.sched.is_idle(old_uid);
        let to_idle = self.sched.is_idle(new_uid);
        let now = self.timing.get_ticks();
        if !(from_idle && to_idle) && self.settings.log_context_switches {
            debug!(
                "Context switch: {} -> {} ({}->{}, pc: {:08x}->{:08x}, {}) +{}us",
                self.thread_name(old_uid),
                self.thread_name(new_uid),
                old_uid,
                new_uid,
                old_pc,
                self.cpu.pc,
                reason,
                cycles_to_us(now.saturating_sub(self.sched.last_switch_cycles))
            );
        }
        self.sched.last_switch_cycles = now;

        if from_idle && to_idle {
            // Free.
        } else if from_idle || to_idle {
            self.timing.add_ticks(SWITCH_COST_IDLE);
        } else {
            self.timing.add_ticks(SWITCH_COST);
        }

        if let Ok(t) = self.objects.get_mut::<Thread>(target) {
            t.nt.wait_type = WaitType::None;
            t.nt.wait_id = 0;
            self.execute_pending_mips_calls(target, true);
        }
    }

    fn thread_name(&self, id: SceUid) -> &str {
        self.objects.get::<Thread>(id).map_or("(none)", |t| t.name())
    }

    /// Park the CPU on idle thread 0.
    pub fn switch_off_thread(&mut self, reason: &str) -> bool {
        let current = self.sched.current_thread;
        if self.sched.is_idle(current) {
            return false;
        }
        // Idle 0 is as good as idle 1.
        let idle0 = self.sched.idle_threads[0];
        if self.objects.get::<Thread>(idle0).is_ok() {
            self.switch_context(idle0, reason);
            return true;
        }
        error!("Unable to switch to idle thread.");
        false
    }

    /// Leave an idle thread for `thread_id`.
    pub fn switch_to_thread(&mut self, thread_id: SceUid, reason: &str) -> bool {
        let current = self.sched.current_thread;
        if !self.sched.is_idle(current) {
            self.report("switch_to_thread used when already on a thread");
            return false;
        }
        if current == thread_id {
            return false;
        }

        match self.objects.get::<Thread>(thread_id) {
            Err(_) => {
                self.report(format!("switch_to_thread: {:x} doesn't exist", thread_id));
                self.hle_resched("switch to deleted thread");
                false
            }
            Ok(t) if t.is_ready() || t.is_running() => {
                if self.current_thread().is_some_and(|c| c.is_running()) {
                    self.change_ready_state(current, true);
                }
                self.switch_context(thread_id, reason);
                true
            }
            Ok(_) => {
                self.hle_resched("switch to waiting thread");
                false
            }
        }
    }

    /// Called by the idle loop: skip to the next event and reschedule.
    pub fn idle(&mut self) {
        self.timing.idle();
        self.reschedule("idle");
    }

    /// Make both idle threads ready, with the module's GP.
    pub fn start_idle_threads(&mut self, module_id: SceUid) {
        let gp = self.module_gp(module_id);
        for id in self.sched.idle_threads {
            let Ok(t) = self.objects.get_mut::<Thread>(id) else {
                self.report(format!("Idle thread {} missing", id));
                continue;
            };
            t.nt.gpreg = gp;
            t.context.r[MIPS_REG_GP] = gp;
            self.sched.ready_queue.prepare(t.nt.current_priority);
            update_ready_queue(&mut self.sched.ready_queue, t, true);
        }
    }

    /// Set up global threading state: trampolines, timed events, action
    /// types, the idle threads and the built-in wait hooks.
    pub(crate) fn init_threading(&mut self) {
        self.sched = SchedulerState::new();
        self.write_trampolines();

        self.sched.event_scheduled_wakeup = self
            .timing
            .register_event("ScheduledWakeup", wait::scheduled_wakeup);
        self.sched.event_thread_end_timeout = self
            .timing
            .register_event("ThreadEndTimeout", wait::thread_end_timeout);
        self.sched.action_after_mips_call = self.mips_calls.registry.register(ActionAfterMipsCall::create);
        self.sched.action_after_callback = self.mips_calls.registry.register(ActionAfterCallback::create);

        let idle = self.sched.hacks.idle;
        for (i, name) in ["idle0", "idle1"].into_iter().enumerate() {
            match self.create_thread_internal(name, 0, idle, 0x7f, 4096, crate::thread::ThreadAttr::KERNEL.bits()) {
                Ok(id) => {
                    self.reset_thread(id, 0);
                    self.sched.idle_threads[i] = id;
                }
                Err(rc) => self.report(format!("Could not create {}: {}", name, rc)),
            }
        }

        self.listen_thread_end(wait::cancel_wakeup);
        self.listen_thread_end(wait::cancel_thread_end_timeout);
        wait::register_thread_wait_funcs(self);
    }

    pub fn listen_thread_end(&mut self, listener: ThreadEndListener) {
        self.sched.thread_end_listeners.push(listener);
    }

    pub(crate) fn fire_thread_end(&mut self, thread_id: SceUid) {
        for listener in self.sched.thread_end_listeners.clone() {
            listener(self, thread_id);
        }
    }

    /// Install begin/end hooks for a wait type.
    pub fn register_wait_type_funcs(&mut self, wait_type: WaitType, begin: WaitCallbackFn, end: WaitCallbackFn) {
        self.sched.wait_type_funcs[wait_type as usize] = Some(WaitTypeFuncs { begin, end });
    }

    /// Serialize the "sceKernelThread" section.
    pub(crate) fn do_state_threading(&mut self, p: &mut PointerWrap) {
        let Self {
            sched,
            timing,
            mips_calls,
            ..
        } = self;
        p.section("sceKernelThread", 1, 3, |p, version| {
            p.sync(&mut sched.in_cb_count);
            p.sync(&mut sched.current_callback_thread);
            p.sync(&mut sched.ready_callbacks_count);
            let hacks = &mut sched.hacks;
            p.sync(&mut hacks.idle);
            p.sync(&mut hacks.thread_return);
            p.sync(&mut hacks.callback_return);
            p.sync(&mut hacks.interrupt_return);
            p.sync(&mut hacks.extend_return);
            p.sync(&mut hacks.module_return);

            p.sync(&mut sched.current_thread);
            p.sync(&mut sched.all_threads);
            p.sync(&mut sched.idle_threads);
            p.sync(&mut sched.dispatch_enabled);
            p.sync(&mut sched.ready_queue);

            p.sync(&mut sched.event_scheduled_wakeup);
            timing.restore_register_event(
                sched.event_scheduled_wakeup,
                "ScheduledWakeup",
                wait::scheduled_wakeup,
            );
            p.sync(&mut sched.event_thread_end_timeout);
            timing.restore_register_event(
                sched.event_thread_end_timeout,
                "ThreadEndTimeout",
                wait::thread_end_timeout,
            );
            p.sync(&mut sched.action_after_mips_call);
            mips_calls
                .registry
                .restore(sched.action_after_mips_call, ActionAfterMipsCall::create);
            p.sync(&mut sched.action_after_callback);
            mips_calls
                .registry
                .restore(sched.action_after_callback, ActionAfterCallback::create);

            p.sync(&mut sched.paused_delays);
            sched.last_switch_cycles = timing.get_ticks();

            if version >= 2 {
                p.sync(&mut sched.thread_event_handlers);
            }
            if version >= 3 {
                p.sync(&mut sched.pending_delete_threads);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_update_ready_queue_running_goes_front() {
        let mut q = ThreadQueueList::new();
        q.prepare(0x20);
        let mut a = Thread::new("a", 0, 0, 0x20, 0);
        a.uid = 1;
        a.nt.status = ThreadStatus::READY;
        q.push_back(0x20, 1);
        let mut b = Thread::new("b", 0, 0, 0x20, 0);
        b.uid = 2;
        b.nt.status = ThreadStatus::RUNNING;
        update_ready_queue(&mut q, &mut b, true);
        assert_eq!(q.threads_at(0x20), vec![2, 1]);
        assert_eq!(b.nt.status, ThreadStatus::READY);

        update_ready_queue(&mut q, &mut b, false);
        assert_eq!(q.threads_at(0x20), vec![1]);
    }

    #[test]
    fn test_boot_state() {
        let k = testing::boot();
        let root = k.current_thread().unwrap();
        assert_eq!(root.name(), "root");
        assert!(root.is_running());
        for id in k.sched.idle_threads {
            let idle = k.objects.get::<Thread>(id).unwrap();
            assert!(idle.is_ready());
            assert_eq!(idle.nt.current_priority, 0x7f);
        }
        assert!(k.is_dispatch_enabled());
    }

    #[test]
    fn test_state_change_with_interrupts_disabled() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        k.interrupts.enabled = false;
        k.change_thread_state(root, ThreadStatus::WAIT);
        assert_eq!(k.current_thread().unwrap().nt.status, ThreadStatus::WAIT);

        k.interrupts.enabled = true;
        k.sched.dispatch_enabled = false;
        k.change_thread_state(root, ThreadStatus::READY);
        assert_eq!(k.current_thread().unwrap().nt.status, ThreadStatus::WAIT);
    }

    #[test]
    fn test_priority_order() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let t30 = testing::spawn(&mut k, "p30", 30);
        let t10 = testing::spawn(&mut k, "p10", 10);
        let t20 = testing::spawn(&mut k, "p20", 20);
        // Root (0x20 = 32) was preempted by each better thread as it started;
        // block it so only the workers compete.
        testing::switch_and_park(&mut k, root);

        let mut order = Vec::new();
        for _ in 0..3 {
            let cur = k.sched.current_thread;
            order.push(cur);
            testing::exit_current(&mut k);
        }
        assert_eq!(order, vec![t10, t20, t30]);
        assert!(k.sched.is_idle(k.sched.current_thread));
    }

    #[test]
    fn test_current_keeps_running_at_equal_priority() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let prio = k.current_thread().unwrap().nt.current_priority;
        let peer = testing::spawn(&mut k, "peer", prio);
        k.reschedule("test");
        assert_eq!(k.sched.current_thread, root);
        assert!(k.sched.ready_queue.contains(prio, peer));
    }

    #[test]
    fn test_switch_cost() {
        let mut k = testing::boot();
        let peer = testing::spawn(&mut k, "peer", 0x30);
        let before = k.timing.get_ticks();
        k.switch_context(peer, "test");
        assert_eq!(k.timing.get_ticks() - before, SWITCH_COST);

        let before = k.timing.get_ticks();
        let idle0 = k.sched.idle_threads[0];
        k.switch_context(idle0, "test");
        assert_eq!(k.timing.get_ticks() - before, SWITCH_COST_IDLE);

        let before = k.timing.get_ticks();
        let idle1 = k.sched.idle_threads[1];
        k.switch_context(idle1, "test");
        assert_eq!(k.timing.get_ticks(), before);
    }

    #[test]
    fn test_dispatch_disabled_blocks_state_change() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        k.sched.dispatch_enabled = false;
        k.change_thread_state(root, ThreadStatus::WAIT);
        assert!(k.current_thread().unwrap().is_running());
        k.sched.dispatch_enabled = true;
        k.change_thread_state(root, ThreadStatus::WAIT);
        assert!(k.current_thread().unwrap().is_waiting());
    }
}
