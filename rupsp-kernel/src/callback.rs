// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest callbacks and their delivery onto the owning thread.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use rupsp_common::{Persist, PointerWrap, PspAddr, SceUid};

use crate::kernel::KernelCore;
use crate::mips_call::ActionAfterCallback;
use crate::thread::{name_from_bytes, name_to_bytes, Thread};

/// Size of `SceKernelCallbackInfo`.
pub const NATIVE_CALLBACK_SIZE: usize = 56;

/// Guest-visible callback status block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCallback {
    pub size: u32,
    pub name: [u8; 32],
    pub thread_id: SceUid,
    pub entrypoint: PspAddr,
    pub common_argument: u32,
    pub notify_count: i32,
    pub notify_arg: i32,
}

impl Default for NativeCallback {
    fn default() -> Self {
        Self {
            size: NATIVE_CALLBACK_SIZE as u32,
            name: [0; 32],
            thread_id: 0,
            entrypoint: 0,
            common_argument: 0,
            notify_count: 0,
            notify_arg: 0,
        }
    }
}

impl NativeCallback {
    pub fn to_bytes(&self) -> [u8; NATIVE_CALLBACK_SIZE] {
        let mut b = [0u8; NATIVE_CALLBACK_SIZE];
        LittleEndian::write_u32(&mut b[0..], self.size);
        b[4..36].copy_from_slice(&self.name);
        LittleEndian::write_i32(&mut b[36..], self.thread_id);
        LittleEndian::write_u32(&mut b[40..], self.entrypoint);
        LittleEndian::write_u32(&mut b[44..], self.common_argument);
        LittleEndian::write_i32(&mut b[48..], self.notify_count);
        LittleEndian::write_i32(&mut b[52..], self.notify_arg);
        b
    }

    pub fn from_bytes(b: &[u8; NATIVE_CALLBACK_SIZE]) -> Self {
        let mut name = [0u8; 32];
        name.copy_from_slice(&b[4..36]);
        Self {
            size: LittleEndian::read_u32(&b[0..]),
            name,
            thread_id: LittleEndian::read_i32(&b[36..]),
            entrypoint: LittleEndian::read_u32(&b[40..]),
            common_argument: LittleEndian::read_u32(&b[44..]),
            notify_count: LittleEndian::read_i32(&b[48..]),
            notify_arg: LittleEndian::read_i32(&b[52..]),
        }
    }
}

impl Persist for NativeCallback {
    fn persist(&mut self, p: &mut PointerWrap) {
        let mut raw = self.to_bytes();
        p.do_bytes(&mut raw);
        if p.is_reading() {
            *self = Self::from_bytes(&raw);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Callback {
    pub uid: SceUid,
    pub nc: NativeCallback,
}

impl Callback {
    pub fn new(name: &str, thread_id: SceUid, entrypoint: PspAddr, common_argument: u32) -> Self {
        Self {
            uid: 0,
            nc: NativeCallback {
                name: name_to_bytes(name),
                thread_id,
                entrypoint,
                common_argument,
                ..NativeCallback::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        name_from_bytes(&self.nc.name)
    }

    pub fn do_state(&mut self, p: &mut PointerWrap) {
        p.section("Callback", 1, 1, |p, _| {
            p.sync(&mut self.nc);
            // Saved registers now live in the MIPS call.
            let mut legacy = [0u32; 5];
            p.sync(&mut legacy);
        });
    }
}

impl KernelCore {
    /// Queue a notification. Only the latest argument is kept.
    pub fn notify_callback(&mut self, cb_id: SceUid, notify_arg: i32) {
        let Ok(cb) = self.objects.get_mut::<Callback>(cb_id) else {
            error!("notify_callback: invalid callback {:08x}", cb_id);
            return;
        };
        if cb.nc.notify_count == 0 {
            self.sched.ready_callbacks_count += 1;
        }
        cb.nc.notify_count += 1;
        cb.nc.notify_arg = notify_arg;
    }

    /// Turn a notified callback into a MIPS call on `thread_id`.
    pub(crate) fn run_callback_on_thread(&mut self, cb_id: SceUid, thread_id: SceUid, resched_after: bool) {
        let Ok(cb) = self.objects.get_mut::<Callback>(cb_id) else {
            error!("run_callback_on_thread: bad callback {}", cb_id);
            return;
        };
        debug!("Turning callback {} into pending mipscall", cb_id);

        let args = [
            cb.nc.notify_count as u32,
            cb.nc.notify_arg as u32,
            cb.nc.common_argument,
        ];
        let entry = cb.nc.entrypoint;
        cb.nc.notify_count = 0;
        cb.nc.notify_arg = 0;

        let action = ActionAfterCallback::new(self.sched.action_after_callback, cb_id);
        self.call_address(
            Some(thread_id),
            entry,
            Some(Box::new(action)),
            &args,
            resched_after,
            cb_id,
        );
    }

    /// First notified callback owned by `thread`.
    fn first_ready_callback(&self, thread: &Thread) -> Option<SceUid> {
        thread.callbacks.iter().copied().find(|&id| {
            self.objects
                .get::<Callback>(id)
                .is_ok_and(|cb| cb.nc.notify_count != 0)
        })
    }

    /// Whether the current thread owns a notified callback.
    pub fn cur_has_ready_callbacks(&self) -> bool {
        if self.sched.ready_callbacks_count == 0 {
            return false;
        }
        self.current_thread()
            .is_some_and(|t| self.first_ready_callback(t).is_some())
    }

    /// Dispatch at most one ready callback of `thread_id`. Only threads
    /// processing callbacks are checked unless `force` is set.
    pub fn check_thread_callbacks(&mut self, thread_id: SceUid, force: bool) -> bool {
        let Ok(thread) = self.objects.get::<Thread>(thread_id) else {
            return false;
        };
        if !thread.is_processing_callbacks && !force {
            return false;
        }
        match self.first_ready_callback(thread) {
            Some(cb_id) => {
                self.run_callback_on_thread(cb_id, thread_id, !force);
                self.sched.ready_callbacks_count -= 1;
                true
            }
            None => false,
        }
    }

    /// Check callbacks on every thread.
    pub fn check_callbacks(&mut self) -> bool {
        if self.sched.ready_callbacks_count == 0 {
            return false;
        }
        if self.sched.ready_callbacks_count < 0 {
            self.report(format!(
                "readyCallbacksCount became negative: {}",
                self.sched.ready_callbacks_count
            ));
        }
        if self.interrupts.in_interrupt || !self.is_dispatch_enabled() || self.in_callback() {
            return false;
        }

        let mut processed = false;
        for id in self.sched.all_threads.clone() {
            if self.check_thread_callbacks(id, false) {
                processed = true;
            }
        }

        if processed {
            let current = self.sched.current_thread;
            return self.execute_pending_mips_calls(current, true);
        }
        false
    }

    /// Run a ready callback of the current thread right away.
    pub fn force_callbacks(&mut self) -> bool {
        if self.sched.ready_callbacks_count == 0 {
            return false;
        }
        if self.sched.ready_callbacks_count < 0 {
            self.report(format!(
                "readyCallbacksCount became negative: {}",
                self.sched.ready_callbacks_count
            ));
        }

        let current = self.sched.current_thread;
        let processed = self.check_thread_callbacks(current, true);
        if processed {
            self.execute_pending_mips_calls(current, false);
        }
        processed
    }

    pub fn in_callback(&self) -> bool {
        self.sched.in_cb_count != 0
    }

    /// Destroy a callback, unlinking it from its owner.
    pub(crate) fn destroy_callback(&mut self, cb_id: SceUid) -> Result<(), rupsp_common::ResultCode> {
        let cb = self.objects.get::<Callback>(cb_id)?;
        let owner = cb.nc.thread_id;
        let pending = cb.nc.notify_count != 0;
        if let Ok(thread) = self.objects.get_mut::<Thread>(owner) {
            thread.callbacks.retain(|&id| id != cb_id);
        }
        if pending {
            self.sched.ready_callbacks_count -= 1;
        }
        self.objects.destroy::<Callback>(cb_id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_native_callback_layout() {
        let mut cb = Callback::new("cb", 0x101, 0x0880_0200, 0x55);
        cb.nc.notify_count = 2;
        cb.nc.notify_arg = -1;
        let raw = cb.nc.to_bytes();
        assert_eq!(LittleEndian::read_u32(&raw[0..]), 56);
        assert_eq!(&raw[4..6], b"cb");
        assert_eq!(LittleEndian::read_i32(&raw[36..]), 0x101);
        assert_eq!(LittleEndian::read_i32(&raw[52..]), -1);
        assert_eq!(NativeCallback::from_bytes(&raw), cb.nc);
    }

    #[test]
    fn test_notify_counts_once() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let cb = k
            .objects
            .create(crate::objects::KernelObject::Callback(Callback::new(
                "c", root, 0x0880_1000, 0,
            )))
            .unwrap();
        k.objects.get_mut::<Thread>(root).unwrap().callbacks.push(cb);

        k.notify_callback(cb, 1);
        k.notify_callback(cb, 2);
        assert_eq!(k.sched.ready_callbacks_count, 1);
        let c = k.objects.get::<Callback>(cb).unwrap();
        assert_eq!(c.nc.notify_count, 2);
        assert_eq!(c.nc.notify_arg, 2);
        assert!(k.cur_has_ready_callbacks());

        k.destroy_callback(cb).unwrap();
        assert_eq!(k.sched.ready_callbacks_count, 0);
        assert!(k.objects.get::<Thread>(root).unwrap().callbacks.is_empty());
    }

    #[test]
    fn test_check_thread_callbacks_needs_processing_flag() {
        let mut k = testing::boot();
        let root = k.sched.current_thread;
        let cb = testing::create_callback(&mut k, "c", 0x0880_1000);
        k.notify_callback(cb, 7);
        assert!(!k.check_thread_callbacks(root, false));
        assert!(k.check_thread_callbacks(root, true));
        assert_eq!(k.sched.ready_callbacks_count, 0);
        assert_eq!(k.cpu.pc, 0x0880_1000);
        assert_eq!(k.cpu.r[rupsp_cpu::state::MIPS_REG_A0 + 1], 7);
    }
}
