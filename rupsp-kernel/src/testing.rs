// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Booted kernels and small scenario helpers for unit tests.

use rupsp_common::settings::Settings;
use rupsp_common::SceUid;

use crate::callback::Callback;
use crate::kernel::KernelCore;
use crate::objects::KernelObject;
use crate::svc::thread::svc_exit_thread;
use crate::thread::{Thread, ThreadAttr, ThreadStatus, WaitType};

pub(crate) const MODULE_ID: SceUid = 1;
pub(crate) const MODULE_ENTRY: u32 = 0x0880_0000;
pub(crate) const MODULE_GP: u32 = 0x0890_8000;
/// Entry point of threads made by [`spawn`].
pub(crate) const THREAD_ENTRY: u32 = 0x0880_1000;

/// Kernel with guest RAM, both idle threads and a running root thread.
pub(crate) fn boot() -> KernelCore {
    let mut k = KernelCore::new(Settings::default()).expect("guest memory");
    k.boot_module(MODULE_ID, MODULE_ENTRY, MODULE_GP, &[]);
    k
}

/// Create and start a user thread, rescheduling like the syscall would.
pub(crate) fn spawn(k: &mut KernelCore, name: &str, priority: u32) -> SceUid {
    let id = k
        .create_thread_internal(name, MODULE_ID, THREAD_ENTRY, priority, 0x1000, ThreadAttr::USER.bits())
        .expect("thread");
    k.hle_call("spawn", |k| k.start_thread(id, 0, 0, false));
    id
}

/// Callback owned by the current thread.
pub(crate) fn create_callback(k: &mut KernelCore, name: &str, entry: u32) -> SceUid {
    let owner = k.sched.current_thread;
    let cb = Callback::new(name, owner, entry, 0);
    let id = k.objects.create(KernelObject::Callback(cb)).expect("callback");
    k.current_thread_mut().expect("current thread").callbacks.push(id);
    id
}

/// Block `id` in a sleep so it never gets picked, switching away if it
/// was running.
pub(crate) fn switch_and_park(k: &mut KernelCore, id: SceUid) {
    k.change_ready_state(id, false);
    let t = k.objects.get_mut::<Thread>(id).expect("thread");
    t.nt.status = ThreadStatus::WAIT;
    t.nt.wait_type = WaitType::Sleep;
    t.nt.wait_id = 0;
    if id == k.sched.current_thread {
        k.reschedule("parked");
    }
}

/// Make a ready thread current by passing through the idle thread.
pub(crate) fn switch_to(k: &mut KernelCore, id: SceUid) {
    k.switch_off_thread("test switch");
    assert!(k.switch_to_thread(id, "test switch"));
}

/// Exit the current thread through the syscall.
pub(crate) fn exit_current(k: &mut KernelCore) {
    k.hle_call("sceKernelExitThread", |k| svc_exit_thread(k, 0));
}
