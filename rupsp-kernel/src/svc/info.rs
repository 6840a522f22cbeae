// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use log::{debug, warn};
use rupsp_common::error;
use rupsp_common::{PspAddr, ResultCode, SceUid};
use rupsp_cpu::state::MIPS_REG_SP;
use rupsp_cpu::MemoryAccess;

use crate::kernel::KernelCore;
use crate::objects::tmid;
use crate::thread::{Thread, ThreadStatus, WaitType, NATIVE_THREAD_SIZE, NATIVE_THREAD_SIZE_OLD};

/// SDK version after which threads report the larger status struct.
const SDK_LARGE_THREAD_INFO: u32 = 0x0206_0010;

/// Largest ID list buffer accepted, in entries.
const MAX_ID_LIST_SIZE: u32 = 0x0800_0000;

/// Fill pattern scanned by the free stack query starts past the thread ID.
const STACK_SCAN_START: u32 = 0x10;

fn resolve_thread(kernel: &KernelCore, thread_id: SceUid) -> SceUid {
    if thread_id == 0 {
        kernel.sched.current_thread
    } else {
        thread_id
    }
}

/// sceKernelGetThreadId
pub fn svc_get_thread_id(kernel: &mut KernelCore) -> SceUid {
    kernel.hle_eat_cycles(180);
    kernel.sched.current_thread
}

/// sceKernelGetThreadCurrentPriority
pub fn svc_get_thread_current_priority(kernel: &mut KernelCore) -> Result<u32, ResultCode> {
    match kernel.current_thread() {
        Some(t) => Ok(t.nt.current_priority),
        None => {
            kernel.report("GetThreadCurrentPriority: no current thread");
            Err(error::FAILURE)
        }
    }
}

/// sceKernelGetThreadExitStatus
pub fn svc_get_thread_exit_status(kernel: &mut KernelCore, thread_id: SceUid) -> Result<u32, ResultCode> {
    let t = kernel.objects.get::<Thread>(thread_id)?;
    // Also true for threads that never started.
    if t.nt.status == ThreadStatus::DORMANT {
        Ok(t.nt.exit_status)
    } else {
        debug!("GetThreadExitStatus({}): not dormant", thread_id);
        Err(error::NOT_DORMANT)
    }
}

/// sceKernelCheckThreadStack: bytes between sp and the stack base.
pub fn svc_check_thread_stack(kernel: &mut KernelCore) -> Result<u32, ResultCode> {
    let Some(t) = kernel.current_thread() else {
        kernel.report("CheckThreadStack: not on thread");
        return Err(error::FAILURE);
    };
    let sp = kernel.cpu.r[MIPS_REG_SP] as i64;
    let diff = (sp - t.current_stack.start as i64).unsigned_abs() as u32;
    debug!("CheckThreadStack() = {}", diff);
    Ok(diff)
}

/// sceKernelGetThreadStackFreeSize: untouched fill bytes above the base.
pub fn svc_get_thread_stack_free_size(kernel: &mut KernelCore, thread_id: SceUid) -> Result<u32, ResultCode> {
    let thread_id = resolve_thread(kernel, thread_id);
    let t = kernel.objects.get::<Thread>(thread_id)?;
    let start = t.current_stack.start;

    let free = (STACK_SCAN_START..t.nt.stack_size)
        .take_while(|&offset| matches!(kernel.memory.ram.read_u8(start + offset), Ok(0xFF)))
        .count() as u32;
    debug!("GetThreadStackFreeSize({}) = {}", thread_id, free & !3);
    Ok(free & !3)
}

/// sceKernelReferThreadStatus. The guest sets the wanted size in the
/// first word.
pub fn svc_refer_thread_status(
    kernel: &mut KernelCore,
    thread_id: SceUid,
    status_ptr: PspAddr,
) -> Result<u32, ResultCode> {
    let thread_id = resolve_thread(kernel, thread_id);
    kernel.objects.get::<Thread>(thread_id)?;
    let wanted = kernel.memory.ram.read_u32(status_ptr).unwrap_or(0);

    let (native_size, copy) = if kernel.settings.compiled_sdk_version > SDK_LARGE_THREAD_INFO {
        if wanted > NATIVE_THREAD_SIZE as u32 {
            warn!("ReferThreadStatus({}, {:08x}): bad size {}", thread_id, status_ptr, wanted);
            return Err(error::ILLEGAL_SIZE);
        }
        (NATIVE_THREAD_SIZE, wanted as usize)
    } else {
        (NATIVE_THREAD_SIZE_OLD, (wanted as usize).min(NATIVE_THREAD_SIZE_OLD))
    };

    let t = kernel.objects.get_mut::<Thread>(thread_id)?;
    t.nt.native_size = native_size as u32;
    let bytes = t.nt.to_bytes();
    if copy != 0 {
        if let Err(e) = kernel.memory.ram.write_bytes(status_ptr, &bytes[..copy]) {
            warn!("ReferThreadStatus({}): could not write status: {}", thread_id, e);
        }
    }
    debug!("ReferThreadStatus({}, {:08x}): {} bytes", thread_id, status_ptr, copy);

    kernel.hle_eat_cycles(1220);
    kernel.hle_resched("refer thread status");
    Ok(0)
}

/// sceKernelReferThreadRunStatus
pub fn svc_refer_thread_run_status(
    kernel: &mut KernelCore,
    thread_id: SceUid,
    status_ptr: PspAddr,
) -> Result<u32, ResultCode> {
    let thread_id = resolve_thread(kernel, thread_id);
    let bytes = kernel.objects.get::<Thread>(thread_id)?.nt.run_status_bytes();
    debug!("ReferThreadRunStatus({}, {:08x})", thread_id, status_ptr);
    if !kernel.memory.ram.is_valid_range(status_ptr, bytes.len() as u32) {
        return Err(error::FAILURE);
    }
    if let Err(e) = kernel.memory.ram.write_bytes(status_ptr, &bytes) {
        warn!("ReferThreadRunStatus({}): could not write status: {}", thread_id, e);
    }
    Ok(0)
}

/// sceKernelGetThreadmanIdType
pub fn svc_get_threadman_id_type(kernel: &mut KernelCore, uid: SceUid) -> Result<u32, ResultCode> {
    match kernel.objects.id_type(uid) {
        Some(id_type) if id_type < 0x1000 => Ok(id_type as u32),
        Some(id_type) => {
            warn!("GetThreadmanIdType({}): invalid object type {}", uid, id_type);
            Err(error::ILLEGAL_ARGUMENT)
        }
        None => {
            debug!("GetThreadmanIdType({}): no such object", uid);
            Err(error::ILLEGAL_ARGUMENT)
        }
    }
}

/// Filter for one of the thread-state ID list categories.
fn thread_category(id_type: i32) -> Option<fn(&Thread) -> bool> {
    match id_type {
        tmid::SLEEP_THREAD => Some(|t: &Thread| t.is_waiting_for(WaitType::Sleep, 0)),
        tmid::DELAY_THREAD => Some(|t: &Thread| t.is_waiting_for(WaitType::Delay, t.uid)),
        tmid::SUSPEND_THREAD => Some(|t: &Thread| t.is_suspended()),
        tmid::DORMANT_THREAD => Some(|t: &Thread| t.is_stopped()),
        _ => None,
    }
}

/// sceKernelGetThreadmanIdList. Writes up to `size` IDs to `buf` and the
/// total count to `count_ptr`.
pub fn svc_get_threadman_id_list(
    kernel: &mut KernelCore,
    id_type: i32,
    buf: PspAddr,
    size: i32,
    count_ptr: PspAddr,
) -> Result<u32, ResultCode> {
    let size = size as u32;
    if size >= MAX_ID_LIST_SIZE {
        kernel.report(format!("GetThreadmanIdList({}, {:08x}, {}): invalid size", id_type, buf, size));
        return Err(error::ILLEGAL_ADDR);
    }
    if size > 0 && !kernel.memory.ram.is_valid_address(buf) {
        kernel.report(format!("GetThreadmanIdList({}, {:08x}, {}): invalid pointer", id_type, buf, size));
        return Err(error::ILLEGAL_ARGUMENT);
    }

    let ids: Vec<SceUid> = if (1..=tmid::TLSPL).contains(&id_type) {
        kernel.objects.list_ids(id_type)
    } else if let Some(matches) = thread_category(id_type) {
        kernel
            .sched
            .all_threads
            .iter()
            .copied()
            .filter(|&id| kernel.objects.get::<Thread>(id).is_ok_and(matches))
            .collect()
    } else {
        kernel.report(format!("GetThreadmanIdList({}): invalid type", id_type));
        return Err(error::ILLEGAL_TYPE);
    };
    debug!("GetThreadmanIdList({}, {:08x}, {}) = {:?}", id_type, buf, size, ids);

    let total = ids.len() as u32;
    for (i, &id) in ids.iter().take(size as usize).enumerate() {
        if let Err(e) = kernel.memory.ram.write_u32(buf + 4 * i as u32, id as u32) {
            warn!("GetThreadmanIdList: could not write id: {}", e);
            break;
        }
    }
    if kernel.memory.ram.is_valid_address(count_ptr) {
        if let Err(e) = kernel.memory.ram.write_u32(count_ptr, total) {
            warn!("GetThreadmanIdList: could not write count: {}", e);
        }
    }
    Ok(total.min(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::callback::svc_create_callback;
    use crate::svc::thread::svc_suspend_thread;
    use crate::svc::wait::svc_sleep_thread;
    use crate::testing;
    use crate::thread::ThreadAttr;
    use byteorder::{ByteOrder, LittleEndian};

    const BUF: PspAddr = 0x0880_4000;
    const COUNT: PspAddr = 0x0880_5000;

    #[test]
    fn test_thread_id_and_priority() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        assert_eq!(svc_get_thread_id(&mut k), root);
        assert_eq!(svc_get_thread_current_priority(&mut k), Ok(k.thread_prio(root)));
    }

    #[test]
    fn test_exit_status_requires_dormant() {
        let mut k = testing::boot();
        let worker = testing::spawn(&mut k, "worker", 0x30);
        assert_eq!(svc_get_thread_exit_status(&mut k, worker), Err(error::NOT_DORMANT));
        assert_eq!(svc_get_thread_exit_status(&mut k, 0x7777), Err(error::UNKNOWN_THID));

        testing::switch_to(&mut k, worker);
        testing::exit_current(&mut k);
        assert_eq!(svc_get_thread_exit_status(&mut k, worker), Ok(0));
    }

    #[test]
    fn test_stack_queries() {
        let mut k = testing::boot();
        let start = k.current_thread().unwrap().current_stack.start;
        let sp = k.cpu.r[MIPS_REG_SP];
        assert_eq!(svc_check_thread_stack(&mut k), Ok(sp - start));

        let id = k
            .create_thread_internal("fresh", 1, 0x0880_1000, 0x30, 0x1000, ThreadAttr::USER.bits())
            .unwrap();
        k.start_thread(id, 0, 0, false).unwrap();
        // Everything below the k0 block and the start reserve stays filled.
        let free = svc_get_thread_stack_free_size(&mut k, id).unwrap();
        assert_eq!(free % 4, 0);
        assert!(free > 0x1000 - 0x200 && free < 0x1000);

        k.memory.ram.write_u8(start + 0x20, 0).unwrap();
        assert_eq!(svc_get_thread_stack_free_size(&mut k, 0), Ok(0x10));
    }

    #[test]
    fn test_refer_thread_status_sizes() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;

        k.settings.compiled_sdk_version = 0x0300_0000;
        k.memory.ram.write_u32(BUF, 200).unwrap();
        assert_eq!(svc_refer_thread_status(&mut k, 0, BUF), Err(error::ILLEGAL_SIZE));

        k.memory.ram.write_u32(BUF, NATIVE_THREAD_SIZE as u32).unwrap();
        assert_eq!(svc_refer_thread_status(&mut k, 0, BUF), Ok(0));
        let raw = k.memory.ram.read_bytes(BUF, NATIVE_THREAD_SIZE as u32).unwrap();
        assert_eq!(LittleEndian::read_u32(&raw[0..]), NATIVE_THREAD_SIZE as u32);
        assert_eq!(&raw[4..8], b"root");
        assert_eq!(LittleEndian::read_u32(&raw[64..]), k.thread_prio(root));

        // Old SDKs cap the copy at the small struct.
        k.settings.compiled_sdk_version = 0x0200_0000;
        k.memory.ram.write_u32(COUNT + 104, 0xAAAA_AAAA).unwrap();
        k.memory.ram.write_u32(COUNT, 200).unwrap();
        assert_eq!(svc_refer_thread_status(&mut k, root, COUNT), Ok(0));
        assert_eq!(k.memory.ram.read_u32(COUNT).unwrap(), NATIVE_THREAD_SIZE_OLD as u32);
        assert_eq!(k.memory.ram.read_u32(COUNT + 104).unwrap(), 0xAAAA_AAAA);
    }

    #[test]
    fn test_refer_run_status() {
        let mut k = testing::boot();
        assert_eq!(svc_refer_thread_run_status(&mut k, 0, 0), Err(error::FAILURE));
        assert_eq!(svc_refer_thread_run_status(&mut k, 0, BUF), Ok(0));
        assert_eq!(k.memory.ram.read_u32(BUF + 4).unwrap(), ThreadStatus::RUNNING.bits());
    }

    #[test]
    fn test_id_type() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let cb = svc_create_callback(&mut k, Some("cb"), 0x0880_2000, 0).unwrap();
        assert_eq!(svc_get_threadman_id_type(&mut k, root), Ok(tmid::THREAD as u32));
        assert_eq!(svc_get_threadman_id_type(&mut k, cb), Ok(tmid::CALLBACK as u32));
        assert_eq!(svc_get_threadman_id_type(&mut k, 0x7777), Err(error::ILLEGAL_ARGUMENT));
    }

    #[test]
    fn test_id_list_threads_and_truncation() {
        let mut k = testing::boot();
        let all = k.objects.list_ids(tmid::THREAD);
        assert_eq!(all.len(), 3);

        let n = svc_get_threadman_id_list(&mut k, tmid::THREAD, BUF, 2, COUNT).unwrap();
        assert_eq!(n, 2);
        assert_eq!(k.memory.ram.read_u32(COUNT).unwrap(), 3);
        assert_eq!(k.memory.ram.read_u32(BUF).unwrap(), all[0] as u32);
        assert_eq!(k.memory.ram.read_u32(BUF + 4).unwrap(), all[1] as u32);

        assert_eq!(svc_get_threadman_id_list(&mut k, tmid::THREAD, 0, 0, COUNT), Ok(0));
        assert_eq!(svc_get_threadman_id_list(&mut k, tmid::THREAD, 0, 4, 0), Err(error::ILLEGAL_ARGUMENT));
        assert_eq!(
            svc_get_threadman_id_list(&mut k, tmid::THREAD, BUF, 0x0800_0000, 0),
            Err(error::ILLEGAL_ADDR)
        );
        assert_eq!(svc_get_threadman_id_list(&mut k, 63, BUF, 4, 0), Err(error::ILLEGAL_TYPE));
    }

    #[test]
    fn test_id_list_categories() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let worker = testing::spawn(&mut k, "worker", 0x30);
        let dormant = k
            .create_thread_internal("dormant", 1, 0x0880_1000, 0x30, 0x1000, 0)
            .unwrap();

        k.hle_call("sleep", |k| svc_sleep_thread(k, false));
        assert_eq!(k.sched.current_thread, worker);
        assert_eq!(svc_get_threadman_id_list(&mut k, tmid::SLEEP_THREAD, BUF, 8, 0), Ok(1));
        assert_eq!(k.memory.ram.read_u32(BUF).unwrap(), root as u32);

        assert_eq!(svc_get_threadman_id_list(&mut k, tmid::DORMANT_THREAD, BUF, 8, 0), Ok(1));
        assert_eq!(k.memory.ram.read_u32(BUF).unwrap(), dormant as u32);

        assert_eq!(svc_suspend_thread(&mut k, root), Ok(0));
        assert_eq!(svc_get_threadman_id_list(&mut k, tmid::SUSPEND_THREAD, BUF, 8, 0), Ok(1));
        assert_eq!(svc_get_threadman_id_list(&mut k, tmid::DELAY_THREAD, BUF, 8, 0), Ok(0));
    }
}
