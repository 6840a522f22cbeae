// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use log::{debug, info, warn};
use rupsp_common::error;
use rupsp_common::{PspAddr, ResultCode, SceUid};
use rupsp_cpu::state::{MIPS_REG_A0, MIPS_REG_RA, MIPS_REG_SP};
use rupsp_cpu::MemoryAccess;

use crate::kernel::KernelCore;
use crate::thread::{
    Thread, ThreadAttr, ThreadStatus, MIN_STACK_SIZE, THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_LOWEST,
};
use crate::thread_events::{THREADEVENT_CREATE, THREADEVENT_EXIT};

/// Smallest stack sceKernelExtendThreadStack accepts.
const MIN_EXTEND_STACK_SIZE: u32 = 512;

/// SDK version from which terminating a thread inside an interrupt fails.
const SDK_TERMINATE_CHECKS_CONTEXT: u32 = 0x0308_0000;

/// sceKernelCreateThread
pub fn svc_create_thread(
    kernel: &mut KernelCore,
    name: Option<&str>,
    entry: PspAddr,
    priority: u32,
    stack_size: i32,
    attr: u32,
    option_addr: PspAddr,
) -> Result<SceUid, ResultCode> {
    debug!(
        "CreateThread: name={:?}, entry={:08x}, prio={:#x}, stack={:#x}, attr={:08x}",
        name, entry, priority, stack_size, attr
    );
    let module_id = kernel.cur_thread_module_id();
    create_thread(kernel, name, module_id, entry, priority, stack_size, attr, option_addr)
}

/// Create a thread for `module_id` with the checks user code gets.
#[allow(clippy::too_many_arguments)]
pub fn create_thread(
    kernel: &mut KernelCore,
    name: Option<&str>,
    module_id: SceUid,
    entry: PspAddr,
    priority: u32,
    stack_size: i32,
    attr: u32,
    option_addr: PspAddr,
) -> Result<SceUid, ResultCode> {
    let Some(name) = name else {
        kernel.report("CreateThread: NULL thread name");
        return Err(error::ERROR);
    };
    if (stack_size as u32) < MIN_STACK_SIZE {
        warn!("CreateThread({}): bogus thread stack size {:08x}", name, stack_size);
        return Err(error::ILLEGAL_STACK_SIZE);
    }

    let mut priority = priority;
    if !(THREAD_PRIORITY_HIGHEST..=THREAD_PRIORITY_LOWEST).contains(&priority) {
        // Firmware clamps instead of failing.
        warn!("CreateThread({}): bogus priority {:08x}", name, priority);
        priority = priority.clamp(THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_LOWEST);
    }
    if entry != 0 && !kernel.memory.ram.is_valid_address(entry) {
        kernel.report(format!("CreateThread({}): invalid thread entry {:08x}", name, entry));
        return Err(error::ILLEGAL_ADDR);
    }
    if attr & !ThreadAttr::USER_MASK != 0 {
        warn!("CreateThread({}): illegal thread attributes {:08x}", name, attr);
        return Err(error::ILLEGAL_ATTR);
    }
    if attr & !ThreadAttr::SUPPORTED != 0 {
        warn!("CreateThread({}): unsupported attributes {:08x}", name, attr);
    }

    let mut attr = attr & !ThreadAttr::USER_ERASE;
    if attr & ThreadAttr::KERNEL.bits() == 0 {
        attr |= ThreadAttr::USER.bits();
    }

    let id = kernel
        .create_thread_internal(name, module_id, entry, priority, stack_size as u32, attr)
        .inspect_err(|_| {
            warn!("CreateThread({}): out of memory, {:08x} stack requested", name, stack_size);
        })?;
    if option_addr != 0 {
        warn!("CreateThread({}): unsupported options parameter {:08x}", name, option_addr);
    }

    // Creating a thread always resumes dispatch.
    kernel.sched.dispatch_enabled = true;
    kernel.hle_eat_cycles(32000);
    kernel.hle_resched("thread created");

    kernel.set_return(id as u32);
    kernel.thread_trigger_event(attr & ThreadAttr::KERNEL.bits() != 0, id, THREADEVENT_CREATE);
    info!("Created thread {} '{}'", id, name);
    Ok(id)
}

/// sceKernelStartThread
pub fn svc_start_thread(
    kernel: &mut KernelCore,
    thread_id: SceUid,
    arg_size: i32,
    arg_ptr: PspAddr,
) -> Result<(), ResultCode> {
    debug!("StartThread: id={}, size={}, argp={:08x}", thread_id, arg_size, arg_ptr);

    if thread_id == 0 {
        return Err(error::ILLEGAL_THID);
    }
    if arg_size < 0 || arg_ptr & 0x8000_0000 != 0 {
        kernel.report(format!(
            "StartThread: bad thread argument pointer/length {:08x} / {:08x}",
            arg_size, arg_ptr
        ));
        return Err(error::ILLEGAL_ADDR);
    }
    let t = kernel.objects.get::<Thread>(thread_id)?;
    if t.nt.status != ThreadStatus::DORMANT {
        warn!("StartThread: thread {} already running", thread_id);
        return Err(error::NOT_DORMANT);
    }

    kernel.hle_eat_cycles(3400);
    kernel.start_thread(thread_id, arg_size, arg_ptr, false)
}

/// sceKernelExitThread
pub fn svc_exit_thread(kernel: &mut KernelCore, exit_status: u32) {
    debug!("ExitThread: status={:08x}", exit_status);
    kernel.exit_current_thread(exit_status, "thread exited");
}

/// _sceKernelExitThread, normally only reached through the exit stub.
pub fn svc_exit_thread_internal(kernel: &mut KernelCore, exit_status: u32) {
    kernel.report(format!(
        "_sceKernelExitThread({:08x}): should not be called directly",
        exit_status
    ));
    kernel.exit_current_thread(exit_status, "thread _exited");
}

/// sceKernelExitDeleteThread
pub fn svc_exit_delete_thread(kernel: &mut KernelCore, exit_status: u32) {
    debug!("ExitDeleteThread: status={:08x}", exit_status);
    let Some(t) = kernel.current_thread() else {
        kernel.report(format!("ExitDeleteThread({:08x}): could not find myself", exit_status));
        return;
    };
    let (uid, is_kernel) = (t.uid, t.is_kernel());

    if let Err(rc) = kernel.delete_thread(uid, exit_status, "thread exited with delete") {
        warn!("ExitDeleteThread: delete failed: {}", rc);
    }
    // Callbacks never resume on a deleted thread.
    kernel.sched.in_cb_count = 0;
    kernel.hle_resched("thread exited with delete");
    kernel.thread_trigger_event(is_kernel, uid, THREADEVENT_EXIT);
}

/// sceKernelDeleteThread
pub fn svc_delete_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<(), ResultCode> {
    debug!("DeleteThread: id={}", thread_id);

    if thread_id == 0 || thread_id == kernel.sched.current_thread {
        return Err(error::NOT_DORMANT);
    }
    let t = kernel.objects.get::<Thread>(thread_id)?;
    if !t.is_stopped() {
        return Err(error::NOT_DORMANT);
    }
    kernel.delete_thread(thread_id, error::THREAD_TERMINATED.raw(), "thread deleted")
}

/// sceKernelTerminateThread
pub fn svc_terminate_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<(), ResultCode> {
    debug!("TerminateThread: id={}", thread_id);

    if kernel.interrupts.in_interrupt && kernel.settings.compiled_sdk_version >= SDK_TERMINATE_CHECKS_CONTEXT {
        return Err(error::ILLEGAL_CONTEXT);
    }
    if thread_id == 0 || thread_id == kernel.sched.current_thread {
        return Err(error::ILLEGAL_THID);
    }
    let t = kernel.objects.get::<Thread>(thread_id)?;
    if t.is_stopped() {
        return Err(error::DORMANT);
    }
    let is_kernel = t.is_kernel();

    kernel.stop_thread(thread_id, error::THREAD_TERMINATED.raw(), "thread terminated");
    if let Ok(t) = kernel.objects.get_mut::<Thread>(thread_id) {
        t.nt.current_priority = t.nt.initial_priority;
    }
    kernel.set_return(0);
    kernel.thread_trigger_event(is_kernel, thread_id, THREADEVENT_EXIT);
    Ok(())
}

/// sceKernelTerminateDeleteThread
pub fn svc_terminate_delete_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<(), ResultCode> {
    debug!("TerminateDeleteThread: id={}", thread_id);

    if thread_id == 0 || thread_id == kernel.sched.current_thread {
        return Err(error::ILLEGAL_THID);
    }
    let t = kernel.objects.get::<Thread>(thread_id)?;
    let (was_stopped, is_kernel) = (t.is_stopped(), t.is_kernel());

    let result = kernel.delete_thread(thread_id, error::THREAD_TERMINATED.raw(), "thread terminated with delete");
    if !was_stopped {
        // Handlers restore v0 when they return.
        kernel.set_return(result.err().unwrap_or(ResultCode::SUCCESS).raw());
        kernel.thread_trigger_event(is_kernel, thread_id, THREADEVENT_EXIT);
    }
    result
}

/// sceKernelSuspendDispatchThread. Returns whether dispatch was enabled.
pub fn svc_suspend_dispatch_thread(kernel: &mut KernelCore) -> Result<u32, ResultCode> {
    if !kernel.interrupts.enabled {
        debug!("SuspendDispatchThread: interrupts disabled");
        return Err(error::CPUDI);
    }
    let old = kernel.sched.dispatch_enabled;
    kernel.sched.dispatch_enabled = false;
    debug!("SuspendDispatchThread: was {}", old);
    kernel.hle_eat_cycles(940);
    Ok(old as u32)
}

/// sceKernelResumeDispatchThread
pub fn svc_resume_dispatch_thread(kernel: &mut KernelCore, enabled: u32) -> Result<u32, ResultCode> {
    if !kernel.interrupts.enabled {
        debug!("ResumeDispatchThread: interrupts disabled");
        return Err(error::CPUDI);
    }
    kernel.sched.dispatch_enabled = enabled != 0;
    debug!("ResumeDispatchThread({})", enabled);
    kernel.hle_resched("dispatch resumed");
    kernel.hle_eat_cycles(940);
    Ok(0)
}

/// sceKernelChangeCurrentThreadAttr. Only the VFPU bit may change.
pub fn svc_change_current_thread_attr(
    kernel: &mut KernelCore,
    clear_attr: u32,
    set_attr: u32,
) -> Result<u32, ResultCode> {
    let vfpu = ThreadAttr::VFPU.bits();
    if clear_attr & !vfpu != 0 || set_attr & !vfpu != 0 {
        kernel.report(format!("ChangeCurrentThreadAttr: invalid attr {:08x} / {:08x}", clear_attr, set_attr));
        return Err(error::ILLEGAL_ATTR);
    }
    let Some(t) = kernel.current_thread_mut() else {
        kernel.report("ChangeCurrentThreadAttr: no current thread");
        return Err(error::FAILURE);
    };
    t.nt.attr = (t.nt.attr & !clear_attr) | set_attr;
    Ok(0)
}

/// sceKernelChangeThreadPriority
pub fn svc_change_thread_priority(
    kernel: &mut KernelCore,
    thread_id: SceUid,
    priority: u32,
) -> Result<u32, ResultCode> {
    debug!("ChangeThreadPriority: id={}, prio={:#x}", thread_id, priority);

    let thread_id = if thread_id == 0 {
        kernel.sched.current_thread
    } else {
        thread_id
    };
    // 0 means the priority of the caller, not of the target.
    let mut priority = priority;
    if priority == 0 {
        match kernel.current_thread() {
            Some(cur) => priority = cur.nt.current_priority,
            None => kernel.report(format!(
                "ChangeThreadPriority({}, 0): no current thread",
                thread_id
            )),
        }
    }

    let t = kernel.objects.get_mut::<Thread>(thread_id)?;
    if t.is_stopped() {
        return Err(error::DORMANT);
    }
    if !(THREAD_PRIORITY_HIGHEST..=THREAD_PRIORITY_LOWEST).contains(&priority) {
        return Err(error::ILLEGAL_PRIORITY);
    }

    let queue = &mut kernel.sched.ready_queue;
    queue.remove(t.nt.current_priority, thread_id);
    t.nt.current_priority = priority;
    queue.prepare(priority);
    if t.is_running() {
        t.nt.status = (t.nt.status - ThreadStatus::RUNNING) | ThreadStatus::READY;
    }
    if t.is_ready() {
        queue.push_back(priority, thread_id);
    }

    kernel.hle_eat_cycles(450);
    kernel.hle_resched("change thread priority");
    Ok(0)
}

/// sceKernelRotateThreadReadyQueue: yield to other threads of a priority.
pub fn svc_rotate_thread_ready_queue(kernel: &mut KernelCore, priority: u32) -> Result<u32, ResultCode> {
    debug!("RotateThreadReadyQueue({:#x})", priority);

    let current = kernel.sched.current_thread;
    let cur_prio = kernel.thread_prio(current);
    let priority = if priority == 0 { cur_prio } else { priority };
    if !(THREAD_PRIORITY_HIGHEST..=THREAD_PRIORITY_LOWEST).contains(&priority) {
        return Err(error::ILLEGAL_PRIORITY);
    }

    if !kernel.sched.ready_queue.is_empty(priority) {
        if cur_prio == priority {
            kernel.sched.ready_queue.push_back(priority, current);
            if let Some(cur) = kernel.current_thread_mut() {
                cur.nt.status = (cur.nt.status - ThreadStatus::RUNNING) | ThreadStatus::READY;
            }
        } else {
            kernel.sched.ready_queue.rotate(priority);
        }
    }

    kernel.hle_resched("rotatethreadreadyqueue");
    kernel.hle_eat_cycles(250);
    Ok(0)
}

/// sceKernelSuspendThread
pub fn svc_suspend_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<u32, ResultCode> {
    if thread_id == 0 || thread_id == kernel.sched.current_thread {
        debug!("SuspendThread({}): cannot suspend current thread", thread_id);
        return Err(error::ILLEGAL_THID);
    }
    let t = kernel.objects.get::<Thread>(thread_id)?;
    if t.is_stopped() {
        return Err(error::DORMANT);
    }
    if t.is_suspended() {
        return Err(error::SUSPEND);
    }

    debug!("SuspendThread({})", thread_id);
    if t.is_ready() {
        kernel.change_ready_state(thread_id, false);
    }
    if let Ok(t) = kernel.objects.get_mut::<Thread>(thread_id) {
        t.nt.status = (t.nt.status - ThreadStatus::READY) | ThreadStatus::SUSPEND;
    }
    Ok(0)
}

/// sceKernelResumeThread
pub fn svc_resume_thread(kernel: &mut KernelCore, thread_id: SceUid) -> Result<u32, ResultCode> {
    if thread_id == 0 || thread_id == kernel.sched.current_thread {
        return Err(error::ILLEGAL_THID);
    }
    let t = kernel.objects.get_mut::<Thread>(thread_id)?;
    if !t.is_suspended() {
        return Err(error::NOT_SUSPEND);
    }

    debug!("ResumeThread({})", thread_id);
    t.nt.status -= ThreadStatus::SUSPEND;
    // Waiting threads stay waiting.
    if t.nt.status.is_empty() {
        kernel.change_ready_state(thread_id, true);
    }
    Ok(0)
}

/// sceKernelExtendThreadStack: run `entry(param)` on a fresh stack. The
/// old ra/sp/pc are kept at the top of the new stack.
pub fn svc_extend_thread_stack(
    kernel: &mut KernelCore,
    size: u32,
    entry: PspAddr,
    param: u32,
) -> Result<u32, ResultCode> {
    debug!("ExtendThreadStack: size={:#x}, entry={:08x}", size, entry);

    if size < MIN_EXTEND_STACK_SIZE {
        kernel.report("ExtendThreadStack: stack size too small");
        return Err(error::ILLEGAL_STACK_SIZE);
    }
    let Ok(t) = kernel.objects.get_mut::<Thread>(kernel.sched.current_thread) else {
        kernel.report("ExtendThreadStack: not on a thread");
        return Err(error::FAILURE);
    };
    if !t.push_extended_stack(&mut kernel.memory, size) {
        kernel.report("ExtendThreadStack: could not allocate new stack");
        return Err(error::NO_MEMORY);
    }
    let end = t.current_stack.end;

    let saved = [kernel.cpu.r[MIPS_REG_RA], kernel.cpu.r[MIPS_REG_SP], kernel.cpu.pc];
    for (i, value) in saved.into_iter().enumerate() {
        if let Err(e) = kernel.memory.ram.write_u32(end - 4 * (i as u32 + 1), value) {
            kernel.report(format!("ExtendThreadStack: could not save registers: {}", e));
        }
    }

    kernel.cpu.pc = entry;
    kernel.cpu.r[MIPS_REG_A0] = param;
    kernel.cpu.r[MIPS_REG_RA] = kernel.sched.hacks.extend_return;
    // Keep sp 16-byte aligned below the three saved words.
    kernel.cpu.r[MIPS_REG_SP] = end - 0x10;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::thread_events::{ThreadEventHandler, THREADID_ALL_USER};
    use crate::objects::KernelObject;
    use rupsp_cpu::state::MIPS_REG_V0;

    fn create(k: &mut KernelCore, name: &str, prio: u32, stack: i32, attr: u32) -> Result<SceUid, ResultCode> {
        let mut out = Err(error::ERROR);
        k.hle_call("create", |k| {
            out = svc_create_thread(k, Some(name), 0x0880_1000, prio, stack, attr, 0);
            out
        });
        out
    }

    #[test]
    fn test_create_validation() {
        let mut k = testing::boot();
        let mut out = Ok(0);
        k.hle_call("create", |k| {
            out = svc_create_thread(k, None, 0x0880_1000, 0x20, 0x1000, 0, 0);
            out
        });
        assert_eq!(out, Err(error::ERROR));
        assert_eq!(create(&mut k, "t", 0x20, 0x1ff, 0), Err(error::ILLEGAL_STACK_SIZE));
        assert_eq!(create(&mut k, "t", 0x20, 0x1000, 0x0000_0100), Err(error::ILLEGAL_ATTR));
        let mut out = Ok(0);
        k.hle_call("create", |k| {
            out = svc_create_thread(k, Some("t"), 0x0100_0000, 0x20, 0x1000, 0, 0);
            out
        });
        assert_eq!(out, Err(error::ILLEGAL_ADDR));
    }

    #[test]
    fn test_create_accepts_empty_name() {
        let mut k = testing::boot();
        let id = create(&mut k, "", 0x20, 0x1000, 0).unwrap();
        let t = k.objects.get::<Thread>(id).unwrap();
        assert_eq!(t.name(), "");
        assert!(t.is_dormant());
    }

    #[test]
    fn test_create_clamps_priority_and_sets_user() {
        let mut k = testing::boot();
        let id = create(&mut k, "low", 0x100, 0x1000, 0).unwrap();
        assert_eq!(k.cpu.r[MIPS_REG_V0], id as u32);
        let t = k.objects.get::<Thread>(id).unwrap();
        assert_eq!(t.nt.current_priority, THREAD_PRIORITY_LOWEST);
        assert!(t.attr().contains(ThreadAttr::USER));
        assert_eq!(t.module_id, 1);

        let id = create(&mut k, "high", 1, 0x1000, 0).unwrap();
        let t = k.objects.get::<Thread>(id).unwrap();
        assert_eq!(t.nt.current_priority, THREAD_PRIORITY_HIGHEST);
    }

    #[test]
    fn test_create_null_entry_allowed() {
        let mut k = testing::boot();
        let mut out = Err(error::ERROR);
        k.hle_call("create", |k| {
            out = svc_create_thread(k, Some("null"), 0, 0x20, 0x1000, 0, 0);
            out
        });
        assert!(out.is_ok());
    }

    #[test]
    fn test_create_event_keeps_return_value() {
        let mut k = testing::boot();
        let handler = ThreadEventHandler::new("h", THREADID_ALL_USER, THREADEVENT_CREATE, 0x0880_2000, 0);
        let teh = k.objects.create(KernelObject::ThreadEventHandler(handler)).unwrap();
        k.sched.thread_event_handlers.insert(THREADID_ALL_USER, vec![teh]);

        let id = create(&mut k, "watched", 0x30, 0x1000, 0).unwrap();
        // The handler is running; the created ID comes back when it returns.
        assert_eq!(k.cpu.pc, 0x0880_2000);
        k.return_from_mips_call();
        assert_eq!(k.cpu.r[MIPS_REG_V0], id as u32);
    }

    #[test]
    fn test_start_validation() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let mut out = Ok(());
        k.hle_call("start", |k| {
            out = svc_start_thread(k, 0, 0, 0);
            out
        });
        assert_eq!(out, Err(error::ILLEGAL_THID));
        k.hle_call("start", |k| {
            out = svc_start_thread(k, root, -1, 0);
            out
        });
        assert_eq!(out, Err(error::ILLEGAL_ADDR));
        k.hle_call("start", |k| {
            out = svc_start_thread(k, root, 0, 0);
            out
        });
        assert_eq!(out, Err(error::NOT_DORMANT));
        k.hle_call("start", |k| {
            out = svc_start_thread(k, 0x7777, 0, 0);
            out
        });
        assert_eq!(out, Err(error::UNKNOWN_THID));
    }

    #[test]
    fn test_delete_and_terminate_rules() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let worker = testing::spawn(&mut k, "worker", 0x30);

        assert_eq!(svc_delete_thread(&mut k, root), Err(error::NOT_DORMANT));
        assert_eq!(svc_delete_thread(&mut k, worker), Err(error::NOT_DORMANT));
        assert_eq!(svc_terminate_thread(&mut k, 0), Err(error::ILLEGAL_THID));

        k.hle_call("terminate", |k| svc_terminate_thread(k, worker));
        assert_eq!(k.cpu.r[MIPS_REG_V0], 0);
        let w = k.objects.get::<Thread>(worker).unwrap();
        assert!(w.is_dormant());
        assert_eq!(w.nt.exit_status, error::THREAD_TERMINATED.raw());
        assert_eq!(svc_terminate_thread(&mut k, worker), Err(error::DORMANT));

        k.hle_call("delete", |k| svc_delete_thread(k, worker));
        assert_eq!(k.cpu.r[MIPS_REG_V0], 0);
        assert!(k.objects.get::<Thread>(worker).is_err());
    }

    #[test]
    fn test_terminate_in_interrupt() {
        let mut k = testing::boot();
        let worker = testing::spawn(&mut k, "worker", 0x30);
        k.interrupts.in_interrupt = true;
        k.settings.compiled_sdk_version = 0x0308_0000;
        assert_eq!(svc_terminate_thread(&mut k, worker), Err(error::ILLEGAL_CONTEXT));
        k.settings.compiled_sdk_version = 0x0307_0000;
        assert!(svc_terminate_thread(&mut k, worker).is_ok());
    }

    #[test]
    fn test_terminate_delete_running_thread() {
        let mut k = testing::boot();
        let worker = testing::spawn(&mut k, "worker", 0x30);
        k.hle_call("terminate delete", |k| svc_terminate_delete_thread(k, worker));
        assert_eq!(k.cpu.r[MIPS_REG_V0], 0);
        assert!(k.objects.get::<Thread>(worker).is_err());
        assert!(!k.sched.ready_queue.contains(0x30, worker));
    }

    #[test]
    fn test_exit_delete_switches_away() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let worker = testing::spawn(&mut k, "worker", 0x10);
        assert_eq!(k.sched.current_thread, worker);
        k.hle_call("exit delete", |k| svc_exit_delete_thread(k, 0));
        assert!(k.objects.get::<Thread>(worker).is_err());
        assert_eq!(k.sched.current_thread, root);
    }

    #[test]
    fn test_dispatch_suspend_resume() {
        let mut k = testing::boot();
        assert_eq!(svc_suspend_dispatch_thread(&mut k), Ok(1));
        assert!(!k.is_dispatch_enabled());
        assert_eq!(svc_suspend_dispatch_thread(&mut k), Ok(0));
        assert_eq!(svc_resume_dispatch_thread(&mut k, 1), Ok(0));
        assert!(k.is_dispatch_enabled());

        k.interrupts.enabled = false;
        assert_eq!(svc_suspend_dispatch_thread(&mut k), Err(error::CPUDI));
        assert_eq!(svc_resume_dispatch_thread(&mut k, 1), Err(error::CPUDI));
    }

    #[test]
    fn test_change_current_thread_attr() {
        let mut k = testing::boot();
        let vfpu = ThreadAttr::VFPU.bits();
        assert_eq!(svc_change_current_thread_attr(&mut k, 0, vfpu), Ok(0));
        assert!(k.current_thread().unwrap().uses_vfpu());
        assert_eq!(svc_change_current_thread_attr(&mut k, vfpu, 0), Ok(0));
        assert!(!k.current_thread().unwrap().uses_vfpu());
        assert_eq!(
            svc_change_current_thread_attr(&mut k, 0, ThreadAttr::KERNEL.bits()),
            Err(error::ILLEGAL_ATTR)
        );
    }

    #[test]
    fn test_change_priority_preempts() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let worker = testing::spawn(&mut k, "worker", 0x30);

        let mut out = Ok(0);
        k.hle_call("prio", |k| {
            out = svc_change_thread_priority(k, worker, 0x10);
            out
        });
        assert_eq!(out, Ok(0));
        assert_eq!(k.sched.current_thread, worker);
        assert!(k.objects.get::<Thread>(root).unwrap().is_ready());

        // 0 takes the caller's priority.
        k.hle_call("prio", |k| {
            out = svc_change_thread_priority(k, root, 0);
            out
        });
        assert_eq!(k.thread_prio(root), 0x10);
        assert_eq!(svc_change_thread_priority(&mut k, root, 0x78), Err(error::ILLEGAL_PRIORITY));
    }

    #[test]
    fn test_rotate_yields_to_peer() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let prio = k.thread_prio(root);
        let peer = testing::spawn(&mut k, "peer", prio);
        assert_eq!(k.sched.current_thread, root);

        k.hle_call("rotate", |k| svc_rotate_thread_ready_queue(k, 0));
        assert_eq!(k.sched.current_thread, peer);
        assert_eq!(k.sched.ready_queue.threads_at(prio), vec![root]);
        assert_eq!(svc_rotate_thread_ready_queue(&mut k, 7), Err(error::ILLEGAL_PRIORITY));
    }

    #[test]
    fn test_suspend_resume() {
        let mut k = testing::boot();
        let worker = testing::spawn(&mut k, "worker", 0x30);
        assert_eq!(svc_suspend_thread(&mut k, worker), Ok(0));
        let t = k.objects.get::<Thread>(worker).unwrap();
        assert_eq!(t.nt.status, ThreadStatus::SUSPEND);
        assert!(!k.sched.ready_queue.contains(0x30, worker));
        assert_eq!(svc_suspend_thread(&mut k, worker), Err(error::SUSPEND));

        assert_eq!(svc_resume_thread(&mut k, worker), Ok(0));
        assert!(k.objects.get::<Thread>(worker).unwrap().is_ready());
        assert!(k.sched.ready_queue.contains(0x30, worker));
        assert_eq!(svc_resume_thread(&mut k, worker), Err(error::NOT_SUSPEND));
        assert_eq!(svc_suspend_thread(&mut k, 0), Err(error::ILLEGAL_THID));
    }

    #[test]
    fn test_extend_stack_round_trip() {
        let mut k = testing::boot();
        let (ra, sp, pc) = (k.cpu.r[MIPS_REG_RA], k.cpu.r[MIPS_REG_SP], k.cpu.pc);
        assert_eq!(svc_extend_thread_stack(&mut k, 0x100, 0x0880_3000, 0), Err(error::ILLEGAL_STACK_SIZE));

        assert_eq!(svc_extend_thread_stack(&mut k, 0x1000, 0x0880_3000, 42), Ok(0));
        let stack = k.current_thread().unwrap().current_stack;
        assert_eq!(k.cpu.pc, 0x0880_3000);
        assert_eq!(k.cpu.r[MIPS_REG_A0], 42);
        assert_eq!(k.cpu.r[MIPS_REG_RA], k.sched.hacks.extend_return);
        assert_eq!(k.cpu.r[MIPS_REG_SP], stack.end - 0x10);
        assert_eq!(k.current_thread().unwrap().pushed_stacks.len(), 1);

        k.return_from_extend_stack();
        assert_eq!((k.cpu.r[MIPS_REG_RA], k.cpu.r[MIPS_REG_SP], k.cpu.pc), (ra, sp, pc));
        assert!(k.current_thread().unwrap().pushed_stacks.is_empty());
    }
}
