// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod callback;
pub mod info;
pub mod thread;
pub mod wait;

use log::{debug, warn};
use rupsp_common::{PspAddr, KERNELOBJECT_MAX_NAME_LENGTH};
use rupsp_cpu::encoding::{make_break, make_jr_ra, make_lui, make_syscall};
use rupsp_cpu::state::{MIPS_REG_A0, MIPS_REG_RA, MIPS_REG_T0};
use rupsp_cpu::MemoryAccess;

use crate::kernel::KernelCore;

/// Syscall codes of the kernel trampolines. They never appear in module
/// import tables, only in code the kernel writes itself.
pub mod fake_syscall {
    pub const BASE: u32 = 0xFF000;
    pub const IDLE: u32 = BASE;
    pub const THREAD_RETURN: u32 = BASE | 1;
    pub const CALLBACK_RETURN: u32 = BASE | 2;
    pub const INTERRUPT_RETURN: u32 = BASE | 3;
    pub const EXTEND_RETURN: u32 = BASE | 4;
    pub const MODULE_RETURN: u32 = BASE | 5;

    pub const fn is_fake(code: u32) -> bool {
        code & !0xFF == BASE
    }
}

/// Syscall codes of the ThreadManForUser functions.
pub mod syscall_number {
    pub const CREATE_THREAD: u32 = 0x2000;
    pub const DELETE_THREAD: u32 = 0x2001;
    pub const START_THREAD: u32 = 0x2002;
    pub const EXIT_THREAD: u32 = 0x2003;
    pub const EXIT_THREAD_INTERNAL: u32 = 0x2004;
    pub const EXIT_DELETE_THREAD: u32 = 0x2005;
    pub const TERMINATE_THREAD: u32 = 0x2006;
    pub const TERMINATE_DELETE_THREAD: u32 = 0x2007;
    pub const SUSPEND_DISPATCH_THREAD: u32 = 0x2008;
    pub const RESUME_DISPATCH_THREAD: u32 = 0x2009;
    pub const CHANGE_CURRENT_THREAD_ATTR: u32 = 0x200A;
    pub const CHANGE_THREAD_PRIORITY: u32 = 0x200B;
    pub const ROTATE_THREAD_READY_QUEUE: u32 = 0x200C;
    pub const SUSPEND_THREAD: u32 = 0x200D;
    pub const RESUME_THREAD: u32 = 0x200E;
    pub const EXTEND_THREAD_STACK: u32 = 0x200F;

    pub const SLEEP_THREAD: u32 = 0x2010;
    pub const SLEEP_THREAD_CB: u32 = 0x2011;
    pub const WAKEUP_THREAD: u32 = 0x2012;
    pub const CANCEL_WAKEUP_THREAD: u32 = 0x2013;
    pub const DELAY_THREAD: u32 = 0x2014;
    pub const DELAY_THREAD_CB: u32 = 0x2015;
    pub const DELAY_SYS_CLOCK_THREAD: u32 = 0x2016;
    pub const DELAY_SYS_CLOCK_THREAD_CB: u32 = 0x2017;
    pub const WAIT_THREAD_END: u32 = 0x2018;
    pub const WAIT_THREAD_END_CB: u32 = 0x2019;
    pub const RELEASE_WAIT_THREAD: u32 = 0x201A;

    pub const CREATE_CALLBACK: u32 = 0x2020;
    pub const DELETE_CALLBACK: u32 = 0x2021;
    pub const NOTIFY_CALLBACK: u32 = 0x2022;
    pub const CANCEL_CALLBACK: u32 = 0x2023;
    pub const GET_CALLBACK_COUNT: u32 = 0x2024;
    pub const CHECK_CALLBACK: u32 = 0x2025;
    pub const REFER_CALLBACK_STATUS: u32 = 0x2026;
    pub const REGISTER_EXIT_CALLBACK: u32 = 0x2027;
    pub const REGISTER_THREAD_EVENT_HANDLER: u32 = 0x2028;
    pub const RELEASE_THREAD_EVENT_HANDLER: u32 = 0x2029;
    pub const REFER_THREAD_EVENT_HANDLER_STATUS: u32 = 0x202A;

    pub const GET_THREAD_ID: u32 = 0x2030;
    pub const GET_THREAD_CURRENT_PRIORITY: u32 = 0x2031;
    pub const GET_THREAD_EXIT_STATUS: u32 = 0x2032;
    pub const CHECK_THREAD_STACK: u32 = 0x2033;
    pub const GET_THREAD_STACK_FREE_SIZE: u32 = 0x2034;
    pub const REFER_THREAD_STATUS: u32 = 0x2035;
    pub const REFER_THREAD_RUN_STATUS: u32 = 0x2036;
    pub const GET_THREADMAN_ID_TYPE: u32 = 0x2037;
    pub const GET_THREADMAN_ID_LIST: u32 = 0x2038;
}

/// Idle loop: `ra` points back at the block, the syscall sits in the
/// delay slot of the jump.
const IDLE_THREAD_CODE: [u32; 4] = [
    make_lui(MIPS_REG_RA as u32, 0x0800),
    make_jr_ra(),
    make_syscall(fake_syscall::IDLE),
    make_break(0),
];

/// Trampolines written after the idle loop, 8 bytes each.
const THREAD_HACKS: [u32; 5] = [
    fake_syscall::THREAD_RETURN,
    fake_syscall::CALLBACK_RETURN,
    fake_syscall::INTERRUPT_RETURN,
    fake_syscall::EXTEND_RETURN,
    fake_syscall::MODULE_RETURN,
];

/// Argument `n` of the MIPS calling convention: a0-a3, then t0-t3.
fn arg(kernel: &KernelCore, n: usize) -> u32 {
    if n < 4 {
        kernel.cpu.r[MIPS_REG_A0 + n]
    } else {
        kernel.cpu.r[MIPS_REG_T0 + n - 4]
    }
}

/// NUL-terminated guest string, `None` for a bad pointer.
fn guest_str(kernel: &KernelCore, addr: PspAddr) -> Option<String> {
    if addr == 0 || !kernel.memory.ram.is_valid_address(addr) {
        return None;
    }
    let mut bytes = Vec::new();
    // Names longer than a kernel object name are cut anyway.
    for offset in 0..=KERNELOBJECT_MAX_NAME_LENGTH as u32 {
        match kernel.memory.ram.read_u8(addr + offset) {
            Ok(0) | Err(_) => break,
            Ok(b) => bytes.push(b),
        }
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

impl KernelCore {
    /// Write the idle loop and return trampolines into kernel memory.
    pub(crate) fn write_trampolines(&mut self) {
        let size = (IDLE_THREAD_CODE.len() + THREAD_HACKS.len() * 2) as u32 * 4;
        let Some(base) = self.memory.kernel.alloc(size, false, "threadrethack") else {
            self.report("Could not allocate kernel trampolines");
            return;
        };

        let mut code = IDLE_THREAD_CODE.to_vec();
        for nid in THREAD_HACKS {
            code.extend([make_jr_ra(), make_syscall(nid)]);
        }
        for (i, word) in code.into_iter().enumerate() {
            if let Err(e) = self.memory.ram.write_u32(base + 4 * i as u32, word) {
                self.report(format!("Could not write kernel trampolines: {}", e));
                return;
            }
        }

        let hack = |i: usize| base + 4 * IDLE_THREAD_CODE.len() as u32 + 8 * i as u32;
        let hacks = &mut self.sched.hacks;
        hacks.idle = base;
        hacks.thread_return = hack(0);
        hacks.callback_return = hack(1);
        hacks.interrupt_return = hack(2);
        hacks.extend_return = hack(3);
        hacks.module_return = hack(4);
    }
}

fn dispatch_fake(kernel: &mut KernelCore, code: u32) {
    match code {
        fake_syscall::IDLE => kernel.idle(),
        fake_syscall::THREAD_RETURN => kernel.hle_call("__KernelReturnFromThread", |k| k.return_from_thread()),
        fake_syscall::CALLBACK_RETURN => kernel.return_from_mips_call(),
        fake_syscall::INTERRUPT_RETURN => kernel.report_once(
            "interrupt-return",
            "Returned from an interrupt handler, but interrupts are not dispatched",
        ),
        fake_syscall::EXTEND_RETURN => {
            kernel.hle_call("__KernelReturnFromExtendStack", |k| k.return_from_extend_stack())
        }
        // Module start functions exit like threads.
        fake_syscall::MODULE_RETURN => kernel.hle_call("__KernelReturnFromModuleFunc", |k| k.return_from_thread()),
        _ => kernel.report(format!("Unknown fake syscall {:#x}", code)),
    }
}

/// Dispatch a `syscall` instruction. Reads arguments from the CPU state and
/// writes the result to v0.
pub fn dispatch_syscall(kernel: &mut KernelCore, code: u32) {
    debug!("Syscall {:#x} called (PC={:08x})", code, kernel.cpu.pc);

    if fake_syscall::is_fake(code) {
        dispatch_fake(kernel, code);
        return;
    }

    let a = |n| arg(kernel, n);
    let (a0, a1, a2, a3, t0, t1) = (a(0), a(1), a(2), a(3), a(4), a(5));

    match code {
        syscall_number::CREATE_THREAD => {
            let name = guest_str(kernel, a0);
            kernel.hle_call("sceKernelCreateThread", |k| {
                thread::svc_create_thread(k, name.as_deref(), a1, a2, a3 as i32, t0, t1)
            });
        }
        syscall_number::DELETE_THREAD => {
            kernel.hle_call("sceKernelDeleteThread", |k| thread::svc_delete_thread(k, a0 as i32));
        }
        syscall_number::START_THREAD => {
            kernel.hle_call("sceKernelStartThread", |k| {
                thread::svc_start_thread(k, a0 as i32, a1 as i32, a2)
            });
        }
        syscall_number::EXIT_THREAD => {
            kernel.hle_call("sceKernelExitThread", |k| thread::svc_exit_thread(k, a0));
        }
        syscall_number::EXIT_THREAD_INTERNAL => {
            kernel.hle_call("_sceKernelExitThread", |k| thread::svc_exit_thread_internal(k, a0));
        }
        syscall_number::EXIT_DELETE_THREAD => {
            kernel.hle_call("sceKernelExitDeleteThread", |k| thread::svc_exit_delete_thread(k, a0));
        }
        syscall_number::TERMINATE_THREAD => {
            kernel.hle_call("sceKernelTerminateThread", |k| thread::svc_terminate_thread(k, a0 as i32));
        }
        syscall_number::TERMINATE_DELETE_THREAD => {
            kernel.hle_call("sceKernelTerminateDeleteThread", |k| {
                thread::svc_terminate_delete_thread(k, a0 as i32)
            });
        }
        syscall_number::SUSPEND_DISPATCH_THREAD => {
            kernel.hle_call("sceKernelSuspendDispatchThread", thread::svc_suspend_dispatch_thread);
        }
        syscall_number::RESUME_DISPATCH_THREAD => {
            kernel.hle_call("sceKernelResumeDispatchThread", |k| {
                thread::svc_resume_dispatch_thread(k, a0)
            });
        }
        syscall_number::CHANGE_CURRENT_THREAD_ATTR => {
            kernel.hle_call("sceKernelChangeCurrentThreadAttr", |k| {
                thread::svc_change_current_thread_attr(k, a0, a1)
            });
        }
        syscall_number::CHANGE_THREAD_PRIORITY => {
            kernel.hle_call("sceKernelChangeThreadPriority", |k| {
                thread::svc_change_thread_priority(k, a0 as i32, a1)
            });
        }
        syscall_number::ROTATE_THREAD_READY_QUEUE => {
            kernel.hle_call("sceKernelRotateThreadReadyQueue", |k| {
                thread::svc_rotate_thread_ready_queue(k, a0)
            });
        }
        syscall_number::SUSPEND_THREAD => {
            kernel.hle_call("sceKernelSuspendThread", |k| thread::svc_suspend_thread(k, a0 as i32));
        }
        syscall_number::RESUME_THREAD => {
            kernel.hle_call("sceKernelResumeThread", |k| thread::svc_resume_thread(k, a0 as i32));
        }
        syscall_number::EXTEND_THREAD_STACK => {
            kernel.hle_call("sceKernelExtendThreadStack", |k| {
                thread::svc_extend_thread_stack(k, a0, a1, a2)
            });
        }

        syscall_number::SLEEP_THREAD => {
            kernel.hle_call("sceKernelSleepThread", |k| wait::svc_sleep_thread(k, false));
        }
        syscall_number::SLEEP_THREAD_CB => {
            kernel.hle_call("sceKernelSleepThreadCB", |k| wait::svc_sleep_thread(k, true));
        }
        syscall_number::WAKEUP_THREAD => {
            kernel.hle_call("sceKernelWakeupThread", |k| wait::svc_wakeup_thread(k, a0 as i32));
        }
        syscall_number::CANCEL_WAKEUP_THREAD => {
            kernel.hle_call("sceKernelCancelWakeupThread", |k| {
                wait::svc_cancel_wakeup_thread(k, a0 as i32)
            });
        }
        syscall_number::DELAY_THREAD => {
            kernel.hle_call("sceKernelDelayThread", |k| wait::svc_delay_thread(k, a0, false));
        }
        syscall_number::DELAY_THREAD_CB => {
            kernel.hle_call("sceKernelDelayThreadCB", |k| wait::svc_delay_thread(k, a0, true));
        }
        syscall_number::DELAY_SYS_CLOCK_THREAD => {
            kernel.hle_call("sceKernelDelaySysClockThread", |k| {
                wait::svc_delay_sys_clock_thread(k, a0, false)
            });
        }
        syscall_number::DELAY_SYS_CLOCK_THREAD_CB => {
            kernel.hle_call("sceKernelDelaySysClockThreadCB", |k| {
                wait::svc_delay_sys_clock_thread(k, a0, true)
            });
        }
        syscall_number::WAIT_THREAD_END => {
            kernel.hle_call("sceKernelWaitThreadEnd", |k| {
                wait::svc_wait_thread_end(k, a0 as i32, a1, false)
            });
        }
        syscall_number::WAIT_THREAD_END_CB => {
            kernel.hle_call("sceKernelWaitThreadEndCB", |k| {
                wait::svc_wait_thread_end(k, a0 as i32, a1, true)
            });
        }
        syscall_number::RELEASE_WAIT_THREAD => {
            kernel.hle_call("sceKernelReleaseWaitThread", |k| {
                wait::svc_release_wait_thread(k, a0 as i32)
            });
        }

        syscall_number::CREATE_CALLBACK => {
            let name = guest_str(kernel, a0);
            kernel.hle_call("sceKernelCreateCallback", |k| {
                callback::svc_create_callback(k, name.as_deref(), a1, a2)
            });
        }
        syscall_number::DELETE_CALLBACK => {
            kernel.hle_call("sceKernelDeleteCallback", |k| callback::svc_delete_callback(k, a0 as i32));
        }
        syscall_number::NOTIFY_CALLBACK => {
            kernel.hle_call("sceKernelNotifyCallback", |k| {
                callback::svc_notify_callback(k, a0 as i32, a1 as i32)
            });
        }
        syscall_number::CANCEL_CALLBACK => {
            kernel.hle_call("sceKernelCancelCallback", |k| callback::svc_cancel_callback(k, a0 as i32));
        }
        syscall_number::GET_CALLBACK_COUNT => {
            kernel.hle_call("sceKernelGetCallbackCount", |k| {
                callback::svc_get_callback_count(k, a0 as i32)
            });
        }
        syscall_number::CHECK_CALLBACK => {
            kernel.hle_call("sceKernelCheckCallback", callback::svc_check_callback);
        }
        syscall_number::REFER_CALLBACK_STATUS => {
            kernel.hle_call("sceKernelReferCallbackStatus", |k| {
                callback::svc_refer_callback_status(k, a0 as i32, a1)
            });
        }
        syscall_number::REGISTER_EXIT_CALLBACK => {
            kernel.hle_call("sceKernelRegisterExitCallback", |k| {
                callback::svc_register_exit_callback(k, a0 as i32)
            });
        }
        syscall_number::REGISTER_THREAD_EVENT_HANDLER => {
            let name = guest_str(kernel, a0);
            kernel.hle_call("sceKernelRegisterThreadEventHandler", |k| {
                callback::svc_register_thread_event_handler(k, name.as_deref(), a1 as i32, a2, a3, t0)
            });
        }
        syscall_number::RELEASE_THREAD_EVENT_HANDLER => {
            kernel.hle_call("sceKernelReleaseThreadEventHandler", |k| {
                callback::svc_release_thread_event_handler(k, a0 as i32)
            });
        }
        syscall_number::REFER_THREAD_EVENT_HANDLER_STATUS => {
            kernel.hle_call("sceKernelReferThreadEventHandlerStatus", |k| {
                callback::svc_refer_thread_event_handler_status(k, a0 as i32, a1)
            });
        }

        syscall_number::GET_THREAD_ID => {
            kernel.hle_call("sceKernelGetThreadId", info::svc_get_thread_id);
        }
        syscall_number::GET_THREAD_CURRENT_PRIORITY => {
            kernel.hle_call("sceKernelGetThreadCurrentPriority", info::svc_get_thread_current_priority);
        }
        syscall_number::GET_THREAD_EXIT_STATUS => {
            kernel.hle_call("sceKernelGetThreadExitStatus", |k| {
                info::svc_get_thread_exit_status(k, a0 as i32)
            });
        }
        syscall_number::CHECK_THREAD_STACK => {
            kernel.hle_call("sceKernelCheckThreadStack", info::svc_check_thread_stack);
        }
        syscall_number::GET_THREAD_STACK_FREE_SIZE => {
            kernel.hle_call("sceKernelGetThreadStackFreeSize", |k| {
                info::svc_get_thread_stack_free_size(k, a0 as i32)
            });
        }
        syscall_number::REFER_THREAD_STATUS => {
            kernel.hle_call("sceKernelReferThreadStatus", |k| {
                info::svc_refer_thread_status(k, a0 as i32, a1)
            });
        }
        syscall_number::REFER_THREAD_RUN_STATUS => {
            kernel.hle_call("sceKernelReferThreadRunStatus", |k| {
                info::svc_refer_thread_run_status(k, a0 as i32, a1)
            });
        }
        syscall_number::GET_THREADMAN_ID_TYPE => {
            kernel.hle_call("sceKernelGetThreadmanIdType", |k| {
                info::svc_get_threadman_id_type(k, a0 as i32)
            });
        }
        syscall_number::GET_THREADMAN_ID_LIST => {
            kernel.hle_call("sceKernelGetThreadmanIdList", |k| {
                info::svc_get_threadman_id_list(k, a0 as i32, a1, a2 as i32, a3)
            });
        }

        _ => {
            warn!("Unimplemented syscall {:#x}", code);
            kernel.report_once("unimplemented-syscall", format!("Unimplemented syscall {:#x}", code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::thread::Thread;
    use rupsp_cpu::encoding::decode_syscall;
    use rupsp_cpu::state::{MIPS_REG_A1, MIPS_REG_A2, MIPS_REG_A3, MIPS_REG_V0};

    #[test]
    fn test_trampolines() {
        let k = testing::boot();
        let hacks = k.sched.hacks;
        assert_eq!(hacks.idle, rupsp_common::KERNEL_PARTITION_BASE);
        assert_eq!(k.memory.ram.read_u32(hacks.idle).unwrap(), IDLE_THREAD_CODE[0]);
        assert_eq!(
            decode_syscall(k.memory.ram.read_u32(hacks.idle + 8).unwrap()),
            Some(fake_syscall::IDLE)
        );
        let expected = [
            (hacks.thread_return, fake_syscall::THREAD_RETURN),
            (hacks.callback_return, fake_syscall::CALLBACK_RETURN),
            (hacks.interrupt_return, fake_syscall::INTERRUPT_RETURN),
            (hacks.extend_return, fake_syscall::EXTEND_RETURN),
            (hacks.module_return, fake_syscall::MODULE_RETURN),
        ];
        for (addr, code) in expected {
            assert_eq!(k.memory.ram.read_u32(addr).unwrap(), make_jr_ra());
            assert_eq!(decode_syscall(k.memory.ram.read_u32(addr + 4).unwrap()), Some(code));
        }
        assert_eq!(hacks.module_return - hacks.thread_return, 32);
    }

    #[test]
    fn test_fake_syscall_range() {
        assert!(fake_syscall::is_fake(fake_syscall::MODULE_RETURN));
        assert!(!fake_syscall::is_fake(syscall_number::CREATE_THREAD));
    }

    #[test]
    fn test_dispatch_create_and_start() {
        let mut k = testing::boot();
        let name = 0x0890_0000;
        k.memory.ram.write_bytes(name, b"worker\0").unwrap();
        k.cpu.r[MIPS_REG_A0] = name;
        k.cpu.r[MIPS_REG_A1] = 0x0880_1000;
        k.cpu.r[MIPS_REG_A2] = 0x30;
        k.cpu.r[MIPS_REG_A3] = 0x1000;
        k.cpu.r[MIPS_REG_T0] = 0;
        k.cpu.r[MIPS_REG_T0 + 1] = 0;
        dispatch_syscall(&mut k, syscall_number::CREATE_THREAD);
        let id = k.cpu.r[MIPS_REG_V0] as i32;
        assert!(id > 0);
        assert_eq!(k.objects.get::<Thread>(id).unwrap().name(), "worker");

        k.cpu.r[MIPS_REG_A0] = id as u32;
        k.cpu.r[MIPS_REG_A1] = 0;
        k.cpu.r[MIPS_REG_A2] = 0;
        dispatch_syscall(&mut k, syscall_number::START_THREAD);
        assert_eq!(k.cpu.r[MIPS_REG_V0], 0);
        assert!(k.objects.get::<Thread>(id).unwrap().is_ready());
    }

    #[test]
    fn test_dispatch_bad_name_pointer() {
        let mut k = testing::boot();
        k.cpu.r[MIPS_REG_A0] = 0;
        k.cpu.r[MIPS_REG_A3] = 0x1000;
        dispatch_syscall(&mut k, syscall_number::CREATE_THREAD);
        assert_eq!(k.cpu.r[MIPS_REG_V0], rupsp_common::error::ERROR.raw());
    }

    #[test]
    fn test_thread_return_trampoline() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let worker = testing::spawn(&mut k, "worker", 0x10);
        assert_eq!(k.sched.current_thread, worker);
        k.cpu.r[MIPS_REG_V0] = 5;
        dispatch_syscall(&mut k, fake_syscall::THREAD_RETURN);
        let w = k.objects.get::<Thread>(worker).unwrap();
        assert!(w.is_dormant());
        assert_eq!(w.nt.exit_status, 5);
        assert_eq!(k.sched.current_thread, root);
    }

    #[test]
    fn test_unknown_syscall_reported_once() {
        let mut k = testing::boot();
        dispatch_syscall(&mut k, 0x1234);
        dispatch_syscall(&mut k, 0x1235);
        let hits = k.reports().iter().filter(|r| r.contains("Unimplemented")).count();
        assert_eq!(hits, 1);
    }
}
