// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use log::debug;
use rupsp_common::error;
use rupsp_common::{PspAddr, ResultCode, SceUid};
use rupsp_cpu::MemoryAccess;

use crate::kernel::KernelCore;
use crate::thread::{Thread, ThreadStatus, WaitType};
use crate::wait::delay_thread_us;

/// sceKernelSleepThread / sceKernelSleepThreadCB
pub fn svc_sleep_thread(kernel: &mut KernelCore, process_callbacks: bool) -> Result<u32, ResultCode> {
    let Some(t) = kernel.current_thread_mut() else {
        kernel.report("SleepThread: bad current thread");
        return Err(error::FAILURE);
    };

    // A wakeup that came first is consumed instead of sleeping.
    if t.nt.wakeup_count > 0 {
        t.nt.wakeup_count -= 1;
        debug!("SleepThread: wakeup count decremented to {}", t.nt.wakeup_count);
        return Ok(0);
    }

    debug!("SleepThread: sleeping");
    kernel.wait_cur_thread(WaitType::Sleep, 0, 0, 0, process_callbacks, "thread slept");
    Ok(0)
}

/// sceKernelWakeupThread
pub fn svc_wakeup_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<u32, ResultCode> {
    if thread_id == kernel.sched.current_thread {
        debug!("WakeupThread({}): unable to wakeup current thread", thread_id);
        return Err(error::ILLEGAL_THID);
    }
    let t = kernel.objects.get_mut::<Thread>(thread_id)?;
    if !t.is_waiting_for(WaitType::Sleep, 0) {
        t.nt.wakeup_count += 1;
        debug!("WakeupThread({}): wakeup count now {}", thread_id, t.nt.wakeup_count);
    } else {
        debug!("WakeupThread({}): woke thread at {}", thread_id, t.nt.wakeup_count);
        kernel.resume_thread_from_wait(thread_id, 0)?;
        kernel.hle_resched("thread woken up");
    }
    Ok(0)
}

/// sceKernelCancelWakeupThread. Returns the discarded wakeup count.
pub fn svc_cancel_wakeup_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<u32, ResultCode> {
    let thread_id = if thread_id == 0 {
        kernel.sched.current_thread
    } else {
        thread_id
    };
    let t = kernel.objects.get_mut::<Thread>(thread_id)?;
    let count = std::mem::take(&mut t.nt.wakeup_count);
    debug!("CancelWakeupThread({}): was {}", thread_id, count);
    Ok(count as u32)
}

/// sceKernelDelayThread / sceKernelDelayThreadCB
pub fn svc_delay_thread(kernel: &mut KernelCore, usec: u32, process_callbacks: bool) -> Result<u32, ResultCode> {
    debug!("DelayThread: {} us, cb={}", usec, process_callbacks);
    delay_current_thread(kernel, usec as u64, process_callbacks);
    Ok(0)
}

/// sceKernelDelaySysClockThread / sceKernelDelaySysClockThreadCB
pub fn svc_delay_sys_clock_thread(
    kernel: &mut KernelCore,
    sys_clock_ptr: PspAddr,
    process_callbacks: bool,
) -> Result<u32, ResultCode> {
    let usec = match kernel.memory.ram.read_u64(sys_clock_ptr) {
        Ok(usec) => usec,
        Err(e) => {
            debug!("DelaySysClockThread: bad clock pointer: {}", e);
            return Err(error::ILLEGAL_ADDRESS);
        }
    };
    debug!("DelaySysClockThread: {} us, cb={}", usec, process_callbacks);
    delay_current_thread(kernel, usec, process_callbacks);
    Ok(0)
}

fn delay_current_thread(kernel: &mut KernelCore, usec: u64, process_callbacks: bool) {
    let current = kernel.sched.current_thread;
    kernel.hle_eat_cycles(2000);
    kernel.schedule_wakeup(current, delay_thread_us(usec));
    kernel.wait_cur_thread(WaitType::Delay, current, 0, 0, process_callbacks, "thread delayed");
}

/// sceKernelWaitThreadEnd / sceKernelWaitThreadEndCB. Returns the exit
/// status of the target.
pub fn svc_wait_thread_end(
    kernel: &mut KernelCore,
    thread_id: SceUid,
    timeout_ptr: PspAddr,
    process_callbacks: bool,
) -> Result<u32, ResultCode> {
    debug!("WaitThreadEnd: id={}, timeout={:08x}, cb={}", thread_id, timeout_ptr, process_callbacks);

    let current = kernel.sched.current_thread;
    if thread_id == 0 || thread_id == current {
        return Err(error::ILLEGAL_THID);
    }
    if !kernel.is_dispatch_enabled() {
        return Err(error::CAN_NOT_WAIT);
    }
    if kernel.interrupts.in_interrupt {
        return Err(error::ILLEGAL_CONTEXT);
    }

    let t = kernel.objects.get::<Thread>(thread_id)?;
    let (status, exit_status) = (t.nt.status, t.nt.exit_status);
    if status != ThreadStatus::DORMANT {
        if kernel.memory.ram.is_valid_address(timeout_ptr) {
            let timeout = kernel.memory.ram.read_u32(timeout_ptr).unwrap_or(0);
            kernel.schedule_thread_end_timeout(current, timeout as u64);
        }
        if let Ok(t) = kernel.objects.get_mut::<Thread>(thread_id) {
            if !t.waiting_threads.contains(&current) {
                t.waiting_threads.push(current);
            }
        }
        kernel.wait_cur_thread(
            WaitType::ThreadEnd,
            thread_id,
            0,
            timeout_ptr,
            process_callbacks,
            "thread wait end",
        );
    } else if process_callbacks {
        kernel.hle_check_current_callbacks();
    }
    Ok(exit_status)
}

/// sceKernelReleaseWaitThread: break a thread out of its wait.
pub fn svc_release_wait_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<u32, ResultCode> {
    if kernel.in_callback() {
        kernel.report(format!("ReleaseWaitThread({}): in callback", thread_id));
    }
    if thread_id == 0 || thread_id == kernel.sched.current_thread {
        return Err(error::ILLEGAL_THID);
    }

    let t = kernel.objects.get::<Thread>(thread_id)?;
    if !t.is_waiting() {
        return Err(error::NOT_WAIT);
    }
    let wait_type = t.nt.wait_type;
    match wait_type {
        WaitType::HleDelay => {
            kernel.report_once("release-hle-delay", "ReleaseWaitThread: refusing to release an HLE delay");
            return Err(error::NOT_WAIT);
        }
        // Module waits are not released either.
        WaitType::Module => return Err(error::NOT_WAIT),
        _ => {}
    }

    debug!("ReleaseWaitThread({})", thread_id);
    kernel.resume_thread_from_wait(thread_id, error::RELEASE_WAIT.raw())?;
    kernel.hle_resched("thread released");
    Ok(0)
}
