// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Blocking waits: entering and leaving a wait, delay and thread-end
//! timeouts, and the hooks that pause a wait while a callback runs on the
//! waiting thread.

use log::{debug, error, warn};
use rupsp_common::{cycles_to_us, error, us_to_cycles, PspAddr, ResultCode, SceUid};
use rupsp_cpu::MemoryAccess;

use crate::kernel::KernelCore;
use crate::thread::{Thread, ThreadStatus, WaitType};

/// Smallest delay the kernel honors, in microseconds.
const MIN_DELAY_US: u64 = 200;
const MIN_DELAY_ROUNDED_US: u64 = 210;
/// Fixed overhead added to every delay.
const DELAY_OVERHEAD_US: u64 = 10;

/// Wakeup time actually used for a requested delay.
///
/// Short delays are rounded up and absurd ones are folded back into a
/// range that still ends.
pub fn delay_thread_us(usec: u64) -> u64 {
    let mut usec = usec;
    if usec < MIN_DELAY_US {
        return MIN_DELAY_ROUNDED_US;
    }
    if usec > 0x8000_0000_0000_0000 {
        usec -= 0x8000_0000_0000_0000;
    }
    if usec > 0x0010_0000_0000_0000 {
        usec >>= 12;
    }
    usec + DELAY_OVERHEAD_US
}

impl KernelCore {
    /// Block the current thread. The switch happens when the syscall
    /// returns.
    pub fn wait_cur_thread(
        &mut self,
        wait_type: WaitType,
        wait_id: SceUid,
        wait_value: u32,
        timeout_ptr: PspAddr,
        process_callbacks: bool,
        reason: &'static str,
    ) {
        if !self.enter_wait(wait_type, wait_id, wait_value, timeout_ptr) {
            return;
        }
        self.hle_resched_cb(process_callbacks, reason);
    }

    /// Block the current thread but run its callbacks first, without an
    /// immediate reschedule.
    pub fn wait_callbacks_cur_thread(
        &mut self,
        wait_type: WaitType,
        wait_id: SceUid,
        wait_value: u32,
        timeout_ptr: PspAddr,
    ) {
        if !self.enter_wait(wait_type, wait_id, wait_value, timeout_ptr) {
            return;
        }
        self.force_callbacks();
    }

    fn enter_wait(&mut self, wait_type: WaitType, wait_id: SceUid, wait_value: u32, timeout_ptr: PspAddr) -> bool {
        if !self.sched.dispatch_enabled {
            self.report("Ignoring wait, dispatching disabled");
            return false;
        }
        let cur_id = self.sched.current_thread;
        let Some(thread) = self.current_thread_mut() else {
            self.report(format!("Wait with no current thread ({})", wait_type.name()));
            return false;
        };
        thread.nt.wait_id = wait_id;
        thread.nt.wait_type = wait_type;
        let status = ThreadStatus::WAIT | (thread.nt.status & ThreadStatus::SUSPEND);
        self.change_thread_state(cur_id, status);

        if let Some(thread) = self.current_thread_mut() {
            thread.nt.num_releases += 1;
            thread.wait_info.wait_value = wait_value;
            thread.wait_info.timeout_ptr = timeout_ptr;
        }
        true
    }

    /// Wake a waiting thread with `retval` in v0.
    pub fn resume_thread_from_wait(&mut self, thread_id: SceUid, retval: u32) -> Result<(), ResultCode> {
        let thread = match self.objects.get_mut::<Thread>(thread_id) {
            Ok(t) => t,
            Err(rc) => {
                error!("resume_thread_from_wait: thread {} doesn't exist", thread_id);
                return Err(rc);
            }
        };
        thread.nt.status.remove(ThreadStatus::WAIT);
        let blocked = ThreadStatus::WAITSUSPEND | ThreadStatus::DORMANT | ThreadStatus::DEAD;
        let runnable = !thread.nt.status.intersects(blocked);
        thread.is_processing_callbacks = false;
        if runnable {
            self.change_ready_state(thread_id, true);
        }
        self.set_thread_return_value(thread_id, retval);
        Ok(())
    }

    pub fn resume_thread_from_wait_u64(&mut self, thread_id: SceUid, retval: u64) -> Result<(), ResultCode> {
        self.resume_thread_from_wait(thread_id, retval as u32)?;
        self.set_thread_return_value_u64(thread_id, retval);
        Ok(())
    }

    /// Guest timeout pointer of a thread waiting on `wait_type`.
    fn wait_timeout_ptr(&self, thread_id: SceUid, wait_type: WaitType) -> PspAddr {
        match self.objects.get::<Thread>(thread_id) {
            Ok(t) if t.nt.wait_type == wait_type => t.wait_info.timeout_ptr,
            Ok(_) => {
                warn!("Thread {} is not waiting on {}", thread_id, wait_type.name());
                0
            }
            Err(_) => 0,
        }
    }

    fn write_timeout(&mut self, timeout_ptr: PspAddr, value: u32) {
        if timeout_ptr == 0 {
            return;
        }
        if let Err(e) = self.memory.ram.write_u32(timeout_ptr, value) {
            warn!("Could not write wait timeout: {}", e);
        }
    }

    fn wait_id_of(&self, thread_id: SceUid, wait_type: WaitType) -> SceUid {
        self.objects
            .get::<Thread>(thread_id)
            .map_or(0, |t| t.wait_id(wait_type))
    }

    pub fn schedule_wakeup(&mut self, thread_id: SceUid, usec: u64) {
        let cycles = us_to_cycles(usec) as i64;
        self.timing
            .schedule_event(cycles, self.sched.event_scheduled_wakeup, thread_id as u64);
    }

    pub fn schedule_thread_end_timeout(&mut self, thread_id: SceUid, usec: u64) {
        let cycles = us_to_cycles(usec) as i64;
        self.timing
            .schedule_event(cycles, self.sched.event_thread_end_timeout, thread_id as u64);
    }

    /// Wake a thread blocked in WaitThreadEnd on `target` if the target has
    /// stopped. Returns false if the waiter must keep waiting.
    pub(crate) fn check_resume_thread_end(&mut self, target: SceUid, waiter: SceUid) -> bool {
        let waiting = self
            .objects
            .get::<Thread>(waiter)
            .is_ok_and(|t| t.is_waiting_for(WaitType::ThreadEnd, target));
        if !waiting {
            return true;
        }
        let Ok(t) = self.objects.get::<Thread>(target) else {
            return false;
        };
        if t.nt.status != ThreadStatus::DORMANT {
            return false;
        }
        let exit_status = t.nt.exit_status;

        let timeout_ptr = self.wait_timeout_ptr(waiter, WaitType::ThreadEnd);
        let left = self
            .timing
            .unschedule_event(self.sched.event_thread_end_timeout, waiter as u64);
        self.write_timeout(timeout_ptr, cycles_to_us(left.max(0) as u64) as u32);
        // The waiter was verified above.
        let _ = self.resume_thread_from_wait(waiter, exit_status);
        true
    }
}

// ---------------------------------------------------------------------------
// Timed events
// ---------------------------------------------------------------------------

/// A delay ran out.
pub(crate) fn scheduled_wakeup(kernel: &mut KernelCore, userdata: u64, _cycles_late: i64) {
    let thread_id = userdata as SceUid;
    if kernel.wait_id_of(thread_id, WaitType::Delay) == thread_id {
        let _ = kernel.resume_thread_from_wait(thread_id, 0);
        kernel.reschedule("thread delay finished");
    }
}

/// A WaitThreadEnd timed out.
pub(crate) fn thread_end_timeout(kernel: &mut KernelCore, userdata: u64, _cycles_late: i64) {
    let thread_id = userdata as SceUid;
    let target = kernel.wait_id_of(thread_id, WaitType::ThreadEnd);
    if target == 0 {
        return;
    }
    let timeout_ptr = kernel.wait_timeout_ptr(thread_id, WaitType::ThreadEnd);
    if let Ok(t) = kernel.objects.get_mut::<Thread>(target) {
        t.waiting_threads.retain(|&id| id != thread_id);
    }
    kernel.write_timeout(timeout_ptr, 0);
    if kernel
        .resume_thread_from_wait(thread_id, error::WAIT_TIMEOUT.raw())
        .is_ok()
    {
        kernel.reschedule("wait timed out");
    }
}

/// Thread-end listener: drop a delay wakeup.
pub(crate) fn cancel_wakeup(kernel: &mut KernelCore, thread_id: SceUid) {
    kernel
        .timing
        .unschedule_event(kernel.sched.event_scheduled_wakeup, thread_id as u64);
}

/// Thread-end listener: drop a WaitThreadEnd timeout.
pub(crate) fn cancel_thread_end_timeout(kernel: &mut KernelCore, thread_id: SceUid) {
    kernel
        .timing
        .unschedule_event(kernel.sched.event_thread_end_timeout, thread_id as u64);
}

// ---------------------------------------------------------------------------
// Callback hooks
// ---------------------------------------------------------------------------

/// Paused waits are keyed by the callback that interrupted an outer
/// callback, or by the thread itself.
fn pause_key(thread_id: SceUid, prev_callback_id: SceUid) -> SceUid {
    if prev_callback_id == 0 {
        thread_id
    } else {
        prev_callback_id
    }
}

fn delay_begin(kernel: &mut KernelCore, thread_id: SceUid, prev_callback_id: SceUid) {
    let key = pause_key(thread_id, prev_callback_id);
    if kernel.wait_id_of(thread_id, WaitType::Delay) != thread_id {
        kernel.report("sceKernelDelayThreadCB: beginning callback with bad wait?");
        return;
    }
    // Two callbacks in a row keep the first deadline.
    if kernel.sched.paused_delays.contains_key(&key) {
        return;
    }
    let left = kernel
        .timing
        .unschedule_event(kernel.sched.event_scheduled_wakeup, thread_id as u64);
    let deadline = (kernel.timing.get_ticks() as i64 + left).max(0) as u64;
    kernel.sched.paused_delays.insert(key, deadline);
    debug!("sceKernelDelayThreadCB: Suspending delay for callback");
}

fn delay_end(kernel: &mut KernelCore, thread_id: SceUid, prev_callback_id: SceUid) {
    let key = pause_key(thread_id, prev_callback_id);
    let Some(deadline) = kernel.sched.paused_delays.remove(&key) else {
        kernel.report("sceKernelDelayThreadCB: cannot find delay deadline");
        let _ = kernel.resume_thread_from_wait(thread_id, 0);
        return;
    };

    let left = deadline as i64 - kernel.timing.get_ticks() as i64;
    if left < 0 {
        let _ = kernel.resume_thread_from_wait(thread_id, 0);
    } else {
        kernel
            .timing
            .schedule_event(left, kernel.sched.event_scheduled_wakeup, thread_id as u64);
        debug!("sceKernelDelayThreadCB: Resuming delay after callback");
    }
}

fn sleep_begin(_kernel: &mut KernelCore, _thread_id: SceUid, _prev_callback_id: SceUid) {
    debug!("sceKernelSleepThreadCB: Suspending sleep for callback");
}

fn sleep_end(kernel: &mut KernelCore, thread_id: SceUid, _prev_callback_id: SceUid) {
    let Ok(thread) = kernel.objects.get_mut::<Thread>(thread_id) else {
        kernel.report("sceKernelSleepThreadCB: thread deleted?");
        return;
    };
    if thread.nt.wakeup_count > 0 {
        thread.nt.wakeup_count -= 1;
        debug!(
            "sceKernelSleepThreadCB: resume from callback, wakeupCount decremented to {}",
            thread.nt.wakeup_count
        );
        let _ = kernel.resume_thread_from_wait(thread_id, 0);
    } else {
        debug!("sceKernelSleepThreadCB: Resuming sleep after callback");
    }
}

fn thread_end_begin(kernel: &mut KernelCore, thread_id: SceUid, prev_callback_id: SceUid) {
    let key = pause_key(thread_id, prev_callback_id);
    let target = kernel.wait_id_of(thread_id, WaitType::ThreadEnd);
    let timeout_ptr = kernel.wait_timeout_ptr(thread_id, WaitType::ThreadEnd);
    let event = kernel.sched.event_thread_end_timeout;

    let Ok(t) = kernel.objects.get::<Thread>(target) else {
        kernel.report("sceKernelWaitThreadEndCB: beginning callback with bad wait id?");
        return;
    };
    if t.paused_waits.contains_key(&key) {
        return;
    }
    if !t.waiting_threads.contains(&thread_id) {
        kernel.report("sceKernelWaitThreadEndCB: wait not found to pause for callback");
        return;
    }

    let deadline = if timeout_ptr != 0 {
        let left = kernel.timing.unschedule_event(event, thread_id as u64);
        (kernel.timing.get_ticks() as i64 + left).max(0) as u64
    } else {
        0
    };
    if let Ok(t) = kernel.objects.get_mut::<Thread>(target) {
        t.waiting_threads.retain(|&id| id != thread_id);
        t.paused_waits.insert(key, deadline);
    }
    debug!("sceKernelWaitThreadEndCB: Suspending wait for callback");
}

fn thread_end_end(kernel: &mut KernelCore, thread_id: SceUid, prev_callback_id: SceUid) {
    let key = pause_key(thread_id, prev_callback_id);
    let target = kernel.wait_id_of(thread_id, WaitType::ThreadEnd);
    let timeout_ptr = kernel.wait_timeout_ptr(thread_id, WaitType::ThreadEnd);

    let deadline = match kernel.objects.get_mut::<Thread>(target) {
        Ok(t) => t.paused_waits.remove(&key),
        Err(_) => None,
    };
    let Some(deadline) = deadline else {
        // Deleted while the callback ran; count the full timeout as used.
        kernel.write_timeout(timeout_ptr, 0);
        let _ = kernel.resume_thread_from_wait(thread_id, error::WAIT_DELETE.raw());
        return;
    };

    if kernel.check_resume_thread_end(target, thread_id) {
        return;
    }

    let left = deadline as i64 - kernel.timing.get_ticks() as i64;
    if deadline != 0 && left < 0 {
        kernel.write_timeout(timeout_ptr, 0);
        let _ = kernel.resume_thread_from_wait(thread_id, error::WAIT_TIMEOUT.raw());
        return;
    }
    if timeout_ptr != 0 {
        kernel
            .timing
            .schedule_event(left, kernel.sched.event_thread_end_timeout, thread_id as u64);
    }
    if let Ok(t) = kernel.objects.get_mut::<Thread>(target) {
        t.waiting_threads.push(thread_id);
    }
    debug!("sceKernelWaitThreadEndCB: Resuming wait from callback");
}

/// Install the hooks for the wait types owned by the thread manager.
pub(crate) fn register_thread_wait_funcs(kernel: &mut KernelCore) {
    kernel.register_wait_type_funcs(WaitType::Delay, delay_begin, delay_end);
    kernel.register_wait_type_funcs(WaitType::Sleep, sleep_begin, sleep_end);
    kernel.register_wait_type_funcs(WaitType::ThreadEnd, thread_end_begin, thread_end_end);
}
