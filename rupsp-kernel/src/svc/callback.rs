// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use log::{debug, warn};
use rupsp_common::error;
use rupsp_common::{PspAddr, ResultCode, SceUid};
use rupsp_cpu::MemoryAccess;

use crate::callback::Callback;
use crate::kernel::KernelCore;
use crate::objects::KernelObject;
use crate::thread::Thread;
use crate::thread_events::{ThreadEventHandler, THREADEVENT_EXIT, THREADEVENT_SUPPORTED, THREADID_ALL_USER};

/// SDK version from which a bad exit callback ID is an error.
const SDK_EXIT_CALLBACK_CHECKED: u32 = 0x0309_0500;

/// Copy `bytes` to a guest status struct whose first word is non-zero.
fn write_status(kernel: &mut KernelCore, status_ptr: PspAddr, bytes: &[u8]) {
    let wanted = match kernel.memory.ram.read_u32(status_ptr) {
        Ok(size) => size,
        Err(_) => return,
    };
    if wanted == 0 {
        return;
    }
    if let Err(e) = kernel.memory.ram.write_bytes(status_ptr, bytes) {
        warn!("Could not write status struct: {}", e);
    }
}

/// sceKernelCreateCallback. The callback belongs to the calling thread.
pub fn svc_create_callback(
    kernel: &mut KernelCore,
    name: Option<&str>,
    entry: PspAddr,
    common_arg: u32,
) -> Result<SceUid, ResultCode> {
    let Some(name) = name else {
        kernel.report("CreateCallback: invalid name");
        return Err(error::ERROR);
    };
    if entry & 0xF000_0000 != 0 {
        kernel.report(format!("CreateCallback({}): invalid func {:08x}", name, entry));
        return Err(error::ILLEGAL_ADDR);
    }

    let owner = kernel.sched.current_thread;
    let id = kernel
        .objects
        .create(KernelObject::Callback(Callback::new(name, owner, entry, common_arg)))?;
    match kernel.current_thread_mut() {
        Some(t) => t.callbacks.push(id),
        None => warn!("CreateCallback({}): no thread to own it", name),
    }
    debug!("CreateCallback({}, {:08x}, {:08x}) = {}", name, entry, common_arg, id);
    Ok(id)
}

/// sceKernelDeleteCallback
pub fn svc_delete_callback(kernel: &mut KernelCore, cb_id: SceUid) -> Result<u32, ResultCode> {
    debug!("DeleteCallback({})", cb_id);
    kernel.destroy_callback(cb_id)?;
    Ok(0)
}

/// sceKernelNotifyCallback
pub fn svc_notify_callback(kernel: &mut KernelCore, cb_id: SceUid, notify_arg: i32) -> Result<u32, ResultCode> {
    debug!("NotifyCallback({}, {:08x})", cb_id, notify_arg);
    kernel.objects.get::<Callback>(cb_id)?;
    kernel.notify_callback(cb_id, notify_arg);
    Ok(0)
}

/// sceKernelCancelCallback. The pending count survives.
pub fn svc_cancel_callback(kernel: &mut KernelCore, cb_id: SceUid) -> Result<u32, ResultCode> {
    debug!("CancelCallback({})", cb_id);
    let cb = kernel.objects.get_mut::<Callback>(cb_id)?;
    cb.nc.notify_arg = 0;
    Ok(0)
}

/// sceKernelGetCallbackCount
pub fn svc_get_callback_count(kernel: &mut KernelCore, cb_id: SceUid) -> Result<u32, ResultCode> {
    let cb = kernel.objects.get::<Callback>(cb_id)?;
    Ok(cb.nc.notify_count as u32)
}

/// sceKernelReferCallbackStatus
pub fn svc_refer_callback_status(
    kernel: &mut KernelCore,
    cb_id: SceUid,
    status_ptr: PspAddr,
) -> Result<u32, ResultCode> {
    debug!("ReferCallbackStatus({}, {:08x})", cb_id, status_ptr);
    let bytes = kernel.objects.get::<Callback>(cb_id)?.nc.to_bytes();
    write_status(kernel, status_ptr, &bytes);
    Ok(0)
}

/// sceKernelCheckCallback. v0 is 1 if a callback ran, restored when it
/// returns.
pub fn svc_check_callback(kernel: &mut KernelCore) {
    kernel.set_return(1);
    if kernel.force_callbacks() {
        debug!("CheckCallback: processed callbacks");
    } else {
        kernel.set_return(0);
    }
    kernel.hle_eat_cycles(230);
}

/// sceKernelRegisterExitCallback
pub fn svc_register_exit_callback(kernel: &mut KernelCore, cb_id: SceUid) -> Result<u32, ResultCode> {
    if kernel.objects.get::<Callback>(cb_id).is_err() {
        warn!("RegisterExitCallback({}): invalid callback", cb_id);
        if kernel.settings.compiled_sdk_version >= SDK_EXIT_CALLBACK_CHECKED {
            return Err(error::ILLEGAL_ARGUMENT);
        }
        return Ok(0);
    }
    debug!("RegisterExitCallback({})", cb_id);
    kernel.sched.registered_exit_cb = cb_id;
    Ok(0)
}

/// sceKernelRegisterThreadEventHandler
pub fn svc_register_thread_event_handler(
    kernel: &mut KernelCore,
    name: Option<&str>,
    thread_id: SceUid,
    mask: u32,
    handler_ptr: PspAddr,
    common_arg: u32,
) -> Result<SceUid, ResultCode> {
    let Some(name) = name else {
        kernel.report("RegisterThreadEventHandler: invalid name");
        return Err(error::ERROR);
    };
    if thread_id == 0 && mask != THREADEVENT_EXIT {
        kernel.report("RegisterThreadEventHandler: thread 0 only takes exit events");
        return Err(error::ILLEGAL_ATTR);
    }
    if thread_id != THREADID_ALL_USER {
        if let Err(rc) = kernel.objects.get::<Thread>(thread_id) {
            kernel.report(format!("RegisterThreadEventHandler: bad thread id {}", thread_id));
            return Err(rc);
        }
    }
    if mask & !THREADEVENT_SUPPORTED != 0 {
        kernel.report(format!("RegisterThreadEventHandler: invalid event mask {:08x}", mask));
        return Err(error::ILLEGAL_MASK);
    }

    let handler = ThreadEventHandler::new(name, thread_id, mask, handler_ptr, common_arg);
    let uid = kernel.objects.create(KernelObject::ThreadEventHandler(handler))?;
    kernel
        .sched
        .thread_event_handlers
        .entry(thread_id)
        .or_default()
        .push(uid);
    debug!("RegisterThreadEventHandler({}, {:#x}, {:#x}) = {}", name, thread_id, mask, uid);
    Ok(uid)
}

/// sceKernelReleaseThreadEventHandler
pub fn svc_release_thread_event_handler(kernel: &mut KernelCore, uid: SceUid) -> Result<u32, ResultCode> {
    let thread_id = match kernel.objects.get::<ThreadEventHandler>(uid) {
        Ok(teh) => teh.nteh.thread_id,
        Err(rc) => {
            kernel.report(format!("ReleaseThreadEventHandler: bad handler id {}", uid));
            return Err(rc);
        }
    };
    if let Some(handlers) = kernel.sched.thread_event_handlers.get_mut(&thread_id) {
        handlers.retain(|&id| id != uid);
        if handlers.is_empty() {
            kernel.sched.thread_event_handlers.remove(&thread_id);
        }
    }
    kernel.objects.destroy::<ThreadEventHandler>(uid)?;
    Ok(0)
}

/// sceKernelReferThreadEventHandlerStatus
pub fn svc_refer_thread_event_handler_status(
    kernel: &mut KernelCore,
    uid: SceUid,
    status_ptr: PspAddr,
) -> Result<u32, ResultCode> {
    let bytes = match kernel.objects.get::<ThreadEventHandler>(uid) {
        Ok(teh) => teh.nteh.to_bytes(),
        Err(rc) => {
            kernel.report(format!("ReferThreadEventHandlerStatus: bad handler id {}", uid));
            return Err(rc);
        }
    };
    write_status(kernel, status_ptr, &bytes);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::NATIVE_CALLBACK_SIZE;
    use crate::testing;
    use crate::thread_events::{NATIVE_THREAD_EVENT_HANDLER_SIZE, THREADEVENT_CREATE};
    use byteorder::{ByteOrder, LittleEndian};
    use rupsp_cpu::state::{MIPS_REG_A0, MIPS_REG_A1, MIPS_REG_A2, MIPS_REG_V0};

    const STATUS: PspAddr = 0x0880_4000;

    #[test]
    fn test_create_callback_owned_by_caller() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        assert_eq!(svc_create_callback(&mut k, None, 0x0880_2000, 0), Err(error::ERROR));
        assert_eq!(
            svc_create_callback(&mut k, Some("cb"), 0x1880_2000, 0),
            Err(error::ILLEGAL_ADDR)
        );

        let id = svc_create_callback(&mut k, Some("cb"), 0x0880_2000, 7).unwrap();
        assert_eq!(k.current_thread().unwrap().callbacks, vec![id]);
        let cb = k.objects.get::<Callback>(id).unwrap();
        assert_eq!(cb.nc.thread_id, root);
        assert_eq!(cb.nc.common_argument, 7);
    }

    #[test]
    fn test_notify_cancel_count() {
        let mut k = testing::boot();
        let id = svc_create_callback(&mut k, Some("cb"), 0x0880_2000, 0).unwrap();
        assert_eq!(svc_notify_callback(&mut k, 0x7777, 1), Err(error::UNKNOWN_CBID));

        svc_notify_callback(&mut k, id, 5).unwrap();
        svc_notify_callback(&mut k, id, 6).unwrap();
        assert_eq!(svc_get_callback_count(&mut k, id), Ok(2));
        assert_eq!(k.sched.ready_callbacks_count, 1);

        svc_cancel_callback(&mut k, id).unwrap();
        let cb = k.objects.get::<Callback>(id).unwrap();
        assert_eq!(cb.nc.notify_arg, 0);
        assert_eq!(cb.nc.notify_count, 2);

        svc_delete_callback(&mut k, id).unwrap();
        assert_eq!(k.sched.ready_callbacks_count, 0);
        assert!(k.current_thread().unwrap().callbacks.is_empty());
        assert_eq!(svc_get_callback_count(&mut k, id), Err(error::UNKNOWN_CBID));
    }

    #[test]
    fn test_refer_callback_status_needs_size() {
        let mut k = testing::boot();
        let id = svc_create_callback(&mut k, Some("status"), 0x0880_2000, 3).unwrap();

        k.memory.ram.write_u32(STATUS, 0).unwrap();
        assert_eq!(svc_refer_callback_status(&mut k, id, STATUS), Ok(0));
        assert_eq!(k.memory.ram.read_u32(STATUS).unwrap(), 0);

        k.memory.ram.write_u32(STATUS, NATIVE_CALLBACK_SIZE as u32).unwrap();
        assert_eq!(svc_refer_callback_status(&mut k, id, STATUS), Ok(0));
        let raw = k.memory.ram.read_bytes(STATUS, NATIVE_CALLBACK_SIZE as u32).unwrap();
        assert_eq!(&raw[4..10], b"status");
        assert_eq!(LittleEndian::read_u32(&raw[40..]), 0x0880_2000);
    }

    #[test]
    fn test_check_callback_runs_and_restores_v0() {
        let mut k = testing::boot();
        let id = svc_create_callback(&mut k, Some("cb"), 0x0880_2000, 9).unwrap();
        svc_notify_callback(&mut k, id, 0x55).unwrap();

        k.hle_call("check", svc_check_callback);
        assert_eq!(k.cpu.pc, 0x0880_2000);
        assert_eq!(k.cpu.r[MIPS_REG_A0], 1);
        assert_eq!(k.cpu.r[MIPS_REG_A1], 0x55);
        assert_eq!(k.cpu.r[MIPS_REG_A2], 9);

        // Returning 0 keeps the callback registered.
        k.cpu.r[MIPS_REG_V0] = 0;
        k.return_from_mips_call();
        assert_eq!(k.cpu.r[MIPS_REG_V0], 1);
        assert!(k.objects.get::<Callback>(id).is_ok());

        k.hle_call("check", svc_check_callback);
        assert_eq!(k.cpu.r[MIPS_REG_V0], 0);
    }

    #[test]
    fn test_register_exit_callback() {
        let mut k = testing::boot();
        k.settings.compiled_sdk_version = 0x0309_0500;
        assert_eq!(svc_register_exit_callback(&mut k, 0x7777), Err(error::ILLEGAL_ARGUMENT));
        k.settings.compiled_sdk_version = 0x0200_0000;
        assert_eq!(svc_register_exit_callback(&mut k, 0x7777), Ok(0));
        assert_eq!(k.sched.registered_exit_cb, 0);

        let id = svc_create_callback(&mut k, Some("exit"), 0x0880_2000, 0).unwrap();
        assert_eq!(svc_register_exit_callback(&mut k, id), Ok(0));
        assert_eq!(k.sched.registered_exit_cb, id);
    }

    #[test]
    fn test_register_handler_errors() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let reg = |k: &mut KernelCore, thread, mask| {
            svc_register_thread_event_handler(k, Some("h"), thread, mask, 0x0880_2000, 0)
        };
        assert_eq!(
            svc_register_thread_event_handler(&mut k, None, root, THREADEVENT_EXIT, 0, 0),
            Err(error::ERROR)
        );
        assert_eq!(reg(&mut k, 0, THREADEVENT_CREATE), Err(error::ILLEGAL_ATTR));
        assert_eq!(reg(&mut k, 0x7777, THREADEVENT_EXIT), Err(error::UNKNOWN_THID));
        assert_eq!(reg(&mut k, root, 0x10), Err(error::ILLEGAL_MASK));

        let uid = reg(&mut k, THREADID_ALL_USER, THREADEVENT_CREATE).unwrap();
        assert_eq!(k.sched.thread_event_handlers[&THREADID_ALL_USER], vec![uid]);
        let uid2 = reg(&mut k, root, THREADEVENT_EXIT).unwrap();
        assert_eq!(k.sched.thread_event_handlers[&root], vec![uid2]);
    }

    #[test]
    fn test_release_and_refer_handler() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let uid = svc_register_thread_event_handler(&mut k, Some("teh"), root, THREADEVENT_EXIT, 0x0880_2000, 4)
            .unwrap();

        k.memory
            .ram
            .write_u32(STATUS, NATIVE_THREAD_EVENT_HANDLER_SIZE as u32)
            .unwrap();
        assert_eq!(svc_refer_thread_event_handler_status(&mut k, uid, STATUS), Ok(0));
        let raw = k
            .memory
            .ram
            .read_bytes(STATUS, NATIVE_THREAD_EVENT_HANDLER_SIZE as u32)
            .unwrap();
        assert_eq!(LittleEndian::read_u32(&raw[36..]), root as u32);

        assert_eq!(svc_release_thread_event_handler(&mut k, uid), Ok(0));
        assert!(!k.sched.thread_event_handlers.contains_key(&root));
        assert_eq!(svc_release_thread_event_handler(&mut k, uid), Err(error::UNKNOWN_TEID));
        assert_eq!(
            svc_refer_thread_event_handler_status(&mut k, uid, STATUS),
            Err(error::UNKNOWN_TEID)
        );
    }
}
