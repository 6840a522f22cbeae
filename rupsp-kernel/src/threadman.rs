// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Thread lifecycle: creation, start, stop and deletion, the root thread
//! and the trampolines a thread returns through.

use log::{debug, info, warn};
use rupsp_common::{align_up, error, PspAddr, ResultCode, SceUid};
use rupsp_cpu::encoding::{make_b, make_jr_ra, make_nop, make_syscall};
use rupsp_cpu::state::{MIPS_REG_A0, MIPS_REG_A1, MIPS_REG_FP, MIPS_REG_GP, MIPS_REG_RA, MIPS_REG_SP, MIPS_REG_V0};
use rupsp_cpu::MemoryAccess;

use crate::callback::Callback;
use crate::kernel::KernelCore;
use crate::objects::KernelObject;
use crate::svc::fake_syscall;
use crate::thread::{Thread, ThreadAttr, ThreadStatus, ThreadWaitInfo, WaitType};
use crate::thread_events::{THREADEVENT_DELETE, THREADEVENT_EXIT, THREADEVENT_START};

/// Stack the kernel keeps below a new thread's arguments.
const START_STACK_RESERVE: u32 = 64;
/// Words saved at the top of an extended stack: ra, sp, pc.
pub(crate) const EXTEND_FRAME_WORDS: usize = 3;

/// Snapshot of one thread for debuggers and the frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugThreadInfo {
    pub id: SceUid,
    pub name: String,
    pub status: ThreadStatus,
    pub entrypoint: PspAddr,
    pub initial_stack: PspAddr,
    pub stack_size: u32,
    pub priority: u32,
    pub wait_type: WaitType,
    pub cur_pc: PspAddr,
    pub is_current: bool,
}

impl KernelCore {
    /// Create a dormant thread with its stack. The thread is forgotten
    /// again if the stack cannot be allocated.
    pub(crate) fn create_thread_internal(
        &mut self,
        name: &str,
        module_id: SceUid,
        entry: PspAddr,
        priority: u32,
        stack_size: u32,
        attr: u32,
    ) -> Result<SceUid, ResultCode> {
        // Firmware always sets the low attribute byte.
        let mut thread = Thread::new(name, module_id, entry, priority, attr | 0xFF);
        thread.nt.gpreg = self.module_gp(module_id);
        thread.nt.stack_size = stack_size;

        let id = self.objects.create(KernelObject::Thread(Box::new(thread)))?;
        self.sched.all_threads.push(id);
        self.sched.ready_queue.prepare(priority);

        let allocated = match self.objects.get_mut::<Thread>(id) {
            Ok(t) => t.allocate_stack(&mut self.memory, stack_size),
            Err(_) => false,
        };
        if !allocated {
            self.sched.all_threads.retain(|&t| t != id);
            if let Err(rc) = self.objects.destroy::<Thread>(id) {
                warn!("Could not drop thread {} after failed stack: {}", id, rc);
            }
            return Err(error::NO_MEMORY);
        }
        debug!("Created thread {} '{}' at {:08x}, prio {:#x}", id, name, entry, priority);
        Ok(id)
    }

    /// Put a thread back into its just-created state, ready to start at its
    /// entry point. The priority resets only when it is better than
    /// `lowest_priority`.
    pub(crate) fn reset_thread(&mut self, thread_id: SceUid, lowest_priority: u32) {
        let thread_return = self.sched.hacks.thread_return;
        let Ok(t) = self.objects.get_mut::<Thread>(thread_id) else {
            return;
        };

        t.context.reset();
        t.context.pc = t.nt.entrypoint;
        if t.nt.current_priority < lowest_priority {
            t.nt.current_priority = t.nt.initial_priority;
        }

        t.nt.wait_type = WaitType::None;
        t.nt.wait_id = 0;
        t.wait_info = ThreadWaitInfo::default();
        t.nt.exit_status = error::NOT_DORMANT.raw();
        t.is_processing_callbacks = false;
        t.current_callback_id = 0;
        t.current_mipscall_id = 0;
        for call_id in t.pending_mips_calls.drain(..) {
            self.mips_calls.pop(call_id);
        }

        // Starting overwrites this, but it must point somewhere sane.
        t.context.r[MIPS_REG_RA] = thread_return;
        t.context.r[MIPS_REG_GP] = t.nt.gpreg;
        let filled = t.fill_stack(&mut self.memory);
        let has_waiters = !t.waiting_threads.is_empty();

        if let Err(e) = filled {
            self.report(format!("Could not fill stack of thread {}: {}", thread_id, e));
        }
        if has_waiters {
            self.report(format!("Resetting thread {} with threads waiting on its end", thread_id));
        }
    }

    /// Start a dormant thread. `arg_size` bytes at `arg_ptr` are copied
    /// onto its stack; with `force_args` the two values are passed through
    /// in a0/a1 untouched.
    pub fn start_thread(
        &mut self,
        thread_id: SceUid,
        arg_size: i32,
        arg_ptr: PspAddr,
        force_args: bool,
    ) -> Result<(), ResultCode> {
        self.objects.get::<Thread>(thread_id)?;
        let current = self.sched.current_thread;
        let cur_prio = self.current_thread().map(|t| t.nt.current_priority);
        self.reset_thread(thread_id, cur_prio.unwrap_or(0));

        let t = self.objects.get_mut::<Thread>(thread_id)?;
        let mut sp = t.context.r[MIPS_REG_SP];
        if (arg_ptr != 0 && arg_size > 0) || force_args {
            if !force_args {
                sp = sp.wrapping_sub(align_up(arg_size as u32, 0x10));
            }
            t.context.r[MIPS_REG_A0] = arg_size as u32;
            t.context.r[MIPS_REG_A1] = sp;
        } else {
            t.context.r[MIPS_REG_A0] = 0;
            t.context.r[MIPS_REG_A1] = 0;
        }
        let args_at = sp;
        sp = sp.wrapping_sub(START_STACK_RESERVE);
        t.context.r[MIPS_REG_SP] = sp;
        t.context.r[MIPS_REG_RA] = sp;
        t.context.r[MIPS_REG_FP] = sp;
        let target_prio = t.nt.current_priority;
        let is_kernel = t.is_kernel();

        if !force_args && self.memory.ram.is_valid_address(arg_ptr) {
            if let Err(e) = self.memory.ram.memcpy(args_at, arg_ptr, arg_size as u32) {
                warn!("Could not copy arguments of thread {}: {}", thread_id, e);
            }
        }

        // Returning from the entry point lands on this stub.
        let stub = [
            make_jr_ra(),
            make_syscall(fake_syscall::THREAD_RETURN),
            make_b(-1),
            make_nop(),
        ];
        for (i, word) in stub.into_iter().enumerate() {
            if let Err(e) = self.memory.ram.write_u32(sp + 4 * i as u32, word) {
                self.report(format!("Could not write thread return stub: {}", e));
                break;
            }
        }

        if let Some(cur_prio) = cur_prio {
            if cur_prio > target_prio {
                self.change_ready_state(current, true);
                self.hle_resched("thread started");
            } else {
                // Starting a worse thread turns dispatch back on.
                self.sched.dispatch_enabled = true;
            }
        }

        self.change_ready_state(thread_id, true);
        self.set_return(0);
        self.thread_trigger_event(is_kernel, thread_id, THREADEVENT_START);
        Ok(())
    }

    /// Make a thread dormant with `exit_status` and wake every thread
    /// waiting for its end.
    pub(crate) fn stop_thread(&mut self, thread_id: SceUid, exit_status: u32, reason: &str) {
        if self.objects.get::<Thread>(thread_id).is_err() {
            self.report(format!("Could not stop thread {}: no such thread ({})", thread_id, reason));
            return;
        }
        debug!("Stopping thread {} with {:08x}: {}", thread_id, exit_status, reason);

        self.change_ready_state(thread_id, false);
        if let Ok(t) = self.objects.get_mut::<Thread>(thread_id) {
            t.nt.exit_status = exit_status;
            t.nt.status = ThreadStatus::DORMANT;
        }
        self.fire_thread_end(thread_id);

        let waiters = self
            .objects
            .get_mut::<Thread>(thread_id)
            .map(|t| std::mem::take(&mut t.waiting_threads))
            .unwrap_or_default();
        for waiter in waiters {
            self.check_resume_thread_end(thread_id, waiter);
        }

        if let Ok(t) = self.objects.get_mut::<Thread>(thread_id) {
            t.nt.wait_type = WaitType::None;
            t.nt.wait_id = 0;
        }
    }

    fn remove_from_thread_queue(&mut self, thread_id: SceUid) {
        if let Ok(t) = self.objects.get::<Thread>(thread_id) {
            let prio = t.nt.current_priority;
            if prio != 0 {
                self.sched.ready_queue.remove(prio, thread_id);
            }
        }
        self.sched.all_threads.retain(|&id| id != thread_id);
    }

    /// Release everything a deleted thread owns except the object itself.
    fn cleanup_thread(&mut self, thread_id: SceUid) {
        let Ok(t) = self.objects.get_mut::<Thread>(thread_id) else {
            return;
        };
        let callbacks = std::mem::take(&mut t.callbacks);
        let pushed = std::mem::take(&mut t.pushed_stacks);
        t.free_stack(&mut self.memory);

        for cb_id in callbacks {
            if let Err(rc) = self.objects.destroy::<Callback>(cb_id) {
                warn!("Callback {} of thread {} already gone: {}", cb_id, thread_id, rc);
            }
        }
        if !pushed.is_empty() {
            self.report(format!("Thread {} ended within an extended stack", thread_id));
            for stack in pushed {
                self.memory.allocator_for(stack.start).free(stack.start);
            }
        }
    }

    /// Stop and destroy a thread. Destruction waits for DELETE event
    /// handlers when any are registered for it.
    pub(crate) fn delete_thread(
        &mut self,
        thread_id: SceUid,
        exit_status: u32,
        reason: &str,
    ) -> Result<(), ResultCode> {
        self.stop_thread(thread_id, exit_status, reason);
        self.remove_from_thread_queue(thread_id);

        if self.sched.current_thread == thread_id {
            self.sched.current_thread = 0;
        }
        if self.sched.current_callback_thread == thread_id {
            self.sched.current_callback_thread = 0;
            self.sched.in_cb_count = 0;
        }

        let t = self.objects.get::<Thread>(thread_id)?;
        let is_kernel = t.is_kernel();
        let notified = t
            .callbacks
            .iter()
            .filter(|&&cb| {
                self.objects
                    .get::<Callback>(cb)
                    .is_ok_and(|c| c.nc.notify_count != 0)
            })
            .count() as i32;
        self.sched.ready_callbacks_count -= notified;

        self.cleanup_thread(thread_id);

        // Handlers restore v0 when they return.
        self.set_return(0);
        if let Ok(t) = self.objects.get_mut::<Thread>(thread_id) {
            t.nt.status = ThreadStatus::DEAD;
        }

        if self.thread_trigger_event(is_kernel, thread_id, THREADEVENT_DELETE) {
            self.sched.pending_delete_threads.push(thread_id);
            return Ok(());
        }
        self.objects.destroy::<Thread>(thread_id).map(|_| ())
    }

    /// Stop the current thread and switch away. Shared by every exit path.
    pub(crate) fn exit_current_thread(&mut self, exit_status: u32, reason: &'static str) {
        let Some(t) = self.current_thread() else {
            self.report(format!("{}: no current thread", reason));
            return;
        };
        let (uid, is_kernel) = (t.uid, t.is_kernel());
        info!("Thread {} exiting with {:08x} ({})", uid, exit_status, reason);

        self.stop_thread(uid, exit_status, reason);
        self.hle_resched(reason);
        self.thread_trigger_event(is_kernel, uid, THREADEVENT_EXIT);
    }

    /// The guest returned from a thread's entry point; v0 is the exit status.
    pub fn return_from_thread(&mut self) {
        let exit_status = self.cpu.r[MIPS_REG_V0];
        self.exit_current_thread(exit_status, "thread returned");
    }

    /// Create and switch to the root thread of a module. Its entry point is
    /// the current PC and `args` are copied onto its stack.
    pub fn setup_root_thread(
        &mut self,
        module_id: SceUid,
        args: &[u8],
        priority: u32,
        stack_size: u32,
        attr: u32,
    ) -> SceUid {
        let entry = self.cpu.pc;
        let id = match self.create_thread_internal("root", module_id, entry, priority, stack_size, attr) {
            Ok(id) => id,
            Err(rc) => {
                self.report(format!("Unable to allocate stack for root thread: {}", rc));
                return 0;
            }
        };
        self.reset_thread(id, 0);

        let prev = self.sched.current_thread;
        if self.current_thread().is_some_and(|t| t.is_running()) {
            self.change_ready_state(prev, true);
        }
        self.sched.current_thread = id;
        if let Ok(t) = self.objects.get_mut::<Thread>(id) {
            // Not scheduled: it simply starts out running.
            t.nt.status = ThreadStatus::RUNNING;
            t.context.load_into(&mut self.cpu, attr & ThreadAttr::VFPU.bits() != 0);
        }

        let len = args.len() as u32;
        self.cpu.r[MIPS_REG_A0] = len;
        let location = self.cpu.r[MIPS_REG_SP].wrapping_sub(align_up(len, 0x10));
        self.cpu.r[MIPS_REG_A1] = location;
        if !args.is_empty() {
            if let Err(e) = self.memory.ram.write_bytes(location, args) {
                self.report(format!("Could not copy root thread arguments: {}", e));
            }
        }
        self.cpu.r[MIPS_REG_SP] = location.wrapping_sub(START_STACK_RESERVE);
        id
    }

    /// Leave a stack entered by `sceKernelExtendThreadStack`, restoring the
    /// registers saved at its top.
    pub fn return_from_extend_stack(&mut self) {
        let Some(t) = self.current_thread() else {
            self.report("Returning from extended stack without a thread");
            return;
        };
        let (uid, end) = (t.uid, t.current_stack.end);

        let mut saved = [0u32; EXTEND_FRAME_WORDS];
        for (i, slot) in saved.iter_mut().enumerate() {
            match self.memory.ram.read_u32(end - 4 * (i as u32 + 1)) {
                Ok(v) => *slot = v,
                Err(e) => {
                    self.report(format!("Could not read extended stack frame: {}", e));
                    return;
                }
            }
        }
        let [ra, sp, pc] = saved;

        let popped = self
            .objects
            .get_mut::<Thread>(uid)
            .is_ok_and(|t| t.pop_extended_stack(&mut self.memory));
        if !popped {
            self.report(format!("Thread {} returned from a stack it never extended", uid));
        }

        debug!("Leaving extended stack of thread {}: pc={:08x}", uid, pc);
        self.cpu.r[MIPS_REG_RA] = ra;
        self.cpu.r[MIPS_REG_SP] = sp;
        self.cpu.pc = pc;
    }

    /// Point a thread's `ra` at one of the return trampolines. Only the
    /// module-return stub can be targeted.
    pub fn set_thread_ra(&mut self, thread_id: SceUid, fake_code: u32) -> Result<(), ResultCode> {
        if fake_code != fake_syscall::MODULE_RETURN {
            self.report(format!("set_thread_ra: unsupported trampoline {:#x}", fake_code));
            return Err(error::FAILURE);
        }
        let ra = self.sched.hacks.module_return;
        if thread_id == self.sched.current_thread {
            self.cpu.r[MIPS_REG_RA] = ra;
            return Ok(());
        }
        match self.objects.get_mut::<Thread>(thread_id) {
            Ok(t) => {
                t.context.r[MIPS_REG_RA] = ra;
                Ok(())
            }
            Err(rc) => {
                warn!("set_thread_ra: no thread {}", thread_id);
                Err(rc)
            }
        }
    }

    pub fn thread_prio(&self, thread_id: SceUid) -> u32 {
        self.objects
            .get::<Thread>(thread_id)
            .map_or(0, |t| t.nt.current_priority)
    }

    pub fn cur_thread_module_id(&self) -> SceUid {
        self.current_thread().map_or(0, |t| t.module_id)
    }

    /// Every live thread, in creation order.
    pub fn get_threads_info(&self) -> Vec<DebugThreadInfo> {
        self.sched
            .all_threads
            .iter()
            .filter_map(|&id| self.objects.get::<Thread>(id).ok())
            .map(|t| {
                let is_current = t.uid == self.sched.current_thread;
                DebugThreadInfo {
                    id: t.uid,
                    name: t.name().to_string(),
                    status: t.nt.status,
                    entrypoint: t.nt.entrypoint,
                    initial_stack: t.nt.initial_stack,
                    stack_size: t.nt.stack_size,
                    priority: t.nt.current_priority,
                    wait_type: t.nt.wait_type,
                    cur_pc: if is_current { self.cpu.pc } else { t.context.pc },
                    is_current,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::thread_events::{ThreadEventHandler, THREADID_ALL_USER};
    use rupsp_common::settings::Settings;

    #[test]
    fn test_create_thread() {
        let mut k = testing::boot();
        let id = k
            .create_thread_internal("worker", 1, 0x0880_1000, 0x30, 0x1000, ThreadAttr::USER.bits())
            .unwrap();
        let t = k.objects.get::<Thread>(id).unwrap();
        assert!(t.is_dormant());
        assert_eq!(t.nt.attr & 0xFF, 0xFF);
        assert_eq!(t.nt.exit_status, error::DORMANT.raw());
        assert_eq!(t.nt.stack_size, 0x1000);
        assert_ne!(t.current_stack.start, 0);
        assert_eq!(k.sched.all_threads.last(), Some(&id));
    }

    #[test]
    fn test_create_thread_out_of_memory() {
        let mut k = testing::boot();
        let threads = k.sched.all_threads.clone();
        let objects = k.objects.len();
        let rc = k.create_thread_internal("huge", 1, 0x0880_1000, 0x30, 0x0400_0000, 0);
        assert_eq!(rc, Err(error::NO_MEMORY));
        assert_eq!(k.sched.all_threads, threads);
        assert_eq!(k.objects.len(), objects);
    }

    #[test]
    fn test_start_copies_args() {
        let mut k = testing::boot();
        let id = k
            .create_thread_internal("worker", 1, 0x0880_1000, 0x30, 0x1000, 0)
            .unwrap();
        let args = 0x0890_0000;
        k.memory.ram.write_bytes(args, b"abcdefgh").unwrap();

        k.hle_call("start", |k| k.start_thread(id, 8, args, false));
        assert_eq!(k.cpu.r[MIPS_REG_V0], 0);

        let t = k.objects.get::<Thread>(id).unwrap();
        assert!(t.is_ready());
        let a1 = t.context.r[MIPS_REG_A1];
        let sp = t.context.r[MIPS_REG_SP];
        assert_eq!(t.context.r[MIPS_REG_A0], 8);
        assert_eq!(a1 % 16, 0);
        assert_eq!(sp, a1 - START_STACK_RESERVE);
        assert_eq!(t.context.r[MIPS_REG_RA], sp);
        assert_eq!(t.context.pc, 0x0880_1000);
        assert_eq!(k.memory.ram.read_bytes(a1, 8).unwrap(), b"abcdefgh");
        assert_eq!(k.memory.ram.read_u32(sp).unwrap(), make_jr_ra());
        assert_eq!(
            k.memory.ram.read_u32(sp + 4).unwrap(),
            make_syscall(fake_syscall::THREAD_RETURN)
        );
        // Worse priority than root: no switch.
        assert_ne!(k.sched.current_thread, id);
    }

    #[test]
    fn test_start_better_thread_preempts() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let id = testing::spawn(&mut k, "fast", 0x10);
        assert_eq!(k.sched.current_thread, id);
        assert_eq!(k.cpu.pc, 0x0880_1000);
        let root_t = k.objects.get::<Thread>(root).unwrap();
        assert!(root_t.is_ready());
    }

    #[test]
    fn test_exit_wakes_end_waiters() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let worker = testing::spawn(&mut k, "worker", 0x30);
        k.hle_call("wait", |k| {
            if let Ok(t) = k.objects.get_mut::<Thread>(worker) {
                t.waiting_threads.push(root);
            }
            k.wait_cur_thread(WaitType::ThreadEnd, worker, 0, 0, false, "test wait");
        });
        assert_eq!(k.sched.current_thread, worker);

        k.hle_call("exit", |k| k.exit_current_thread(7, "test exit"));
        assert_eq!(k.sched.current_thread, root);
        assert_eq!(k.cpu.r[MIPS_REG_V0], 7);
        let w = k.objects.get::<Thread>(worker).unwrap();
        assert!(w.is_dormant());
        assert!(w.waiting_threads.is_empty());
    }

    #[test]
    fn test_delete_frees_stack() {
        let mut k = testing::boot();
        let before = k.memory.user.free_bytes();
        let id = k
            .create_thread_internal("worker", 1, 0x0880_1000, 0x30, 0x4000, 0)
            .unwrap();
        assert!(k.memory.user.free_bytes() < before);

        k.hle_call("delete", |k| k.delete_thread(id, error::THREAD_TERMINATED.raw(), "test"));
        assert_eq!(k.cpu.r[MIPS_REG_V0], 0);
        assert!(k.objects.get::<Thread>(id).is_err());
        assert!(!k.sched.all_threads.contains(&id));
        assert_eq!(k.memory.user.free_bytes(), before);
    }

    #[test]
    fn test_delete_waits_for_handler() {
        let mut k = testing::boot();
        let id = k
            .create_thread_internal("worker", 1, 0x0880_1000, 0x30, 0x1000, ThreadAttr::USER.bits())
            .unwrap();
        let handler = ThreadEventHandler::new("h", THREADID_ALL_USER, THREADEVENT_DELETE, 0x0880_2000, 5);
        let teh = k.objects.create(KernelObject::ThreadEventHandler(handler)).unwrap();
        k.sched
            .thread_event_handlers
            .entry(THREADID_ALL_USER)
            .or_default()
            .push(teh);

        k.hle_call("delete", |k| k.delete_thread(id, 0, "test"));
        // The handler runs on root right away.
        assert_eq!(k.cpu.pc, 0x0880_2000);
        assert_eq!(k.cpu.r[MIPS_REG_A0], THREADEVENT_DELETE);
        assert_eq!(k.cpu.r[MIPS_REG_A1], id as u32);
        assert!(k.objects.get::<Thread>(id).unwrap().is_dead());
        assert_eq!(k.sched.pending_delete_threads, vec![id]);

        k.return_from_mips_call();
        assert!(k.objects.get::<Thread>(id).is_err());
        assert!(k.sched.pending_delete_threads.is_empty());
    }

    #[test]
    fn test_root_thread_args() {
        let mut k = KernelCore::new(Settings::default()).unwrap();
        let root = k.boot_module(1, 0x0880_0000, 0x0890_8000, b"game.prx\0");
        assert_eq!(k.sched.current_thread, root);
        assert_eq!(k.cpu.pc, 0x0880_0000);
        assert_eq!(k.cpu.r[MIPS_REG_GP], 0x0890_8000);
        assert_eq!(k.cpu.r[MIPS_REG_A0], 9);
        let a1 = k.cpu.r[MIPS_REG_A1];
        assert_eq!(k.memory.ram.read_bytes(a1, 9).unwrap(), b"game.prx\0");
        assert_eq!(k.cpu.r[MIPS_REG_SP], a1 - START_STACK_RESERVE);
    }

    #[test]
    fn test_threads_info() {
        let mut k = testing::boot();
        let worker = testing::spawn(&mut k, "worker", 0x30);
        let info = k.get_threads_info();
        let names: Vec<&str> = info.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["idle0", "idle1", "root", "worker"]);
        let root = info.iter().find(|i| i.name == "root").unwrap();
        assert!(root.is_current);
        assert_eq!(root.cur_pc, k.cpu.pc);
        let w = info.iter().find(|i| i.id == worker).unwrap();
        assert_eq!(w.status, ThreadStatus::READY);
        assert_eq!(w.priority, 0x30);
    }

    #[test]
    fn test_set_thread_ra() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let worker = testing::spawn(&mut k, "worker", 0x30);
        assert_eq!(k.set_thread_ra(root, fake_syscall::MODULE_RETURN), Ok(()));
        assert_eq!(k.cpu.r[MIPS_REG_RA], k.sched.hacks.module_return);
        assert_eq!(k.set_thread_ra(worker, fake_syscall::MODULE_RETURN), Ok(()));
        let t = k.objects.get::<Thread>(worker).unwrap();
        assert_eq!(t.context.r[MIPS_REG_RA], k.sched.hacks.module_return);
        assert_eq!(k.set_thread_ra(worker, fake_syscall::THREAD_RETURN), Err(error::FAILURE));
    }
}
