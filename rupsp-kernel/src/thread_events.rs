// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Thread lifecycle event handlers (create, start, exit, delete).

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use rupsp_common::{Persist, PointerWrap, PspAddr, SceUid};

use crate::kernel::KernelCore;
use crate::thread::{name_from_bytes, name_to_bytes, Thread};

pub const THREADEVENT_CREATE: u32 = 1;
pub const THREADEVENT_START: u32 = 2;
pub const THREADEVENT_EXIT: u32 = 4;
pub const THREADEVENT_DELETE: u32 = 8;
pub const THREADEVENT_SUPPORTED: u32 =
    THREADEVENT_CREATE | THREADEVENT_START | THREADEVENT_EXIT | THREADEVENT_DELETE;

/// Registration target matching every user thread.
pub const THREADID_ALL_USER: SceUid = 0xFFFF_FFF0_u32 as SceUid;

/// Size of `SceKernelThreadEventHandlerInfo`.
pub const NATIVE_THREAD_EVENT_HANDLER_SIZE: usize = 52;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeThreadEventHandler {
    pub size: u32,
    pub name: [u8; 32],
    pub thread_id: SceUid,
    pub mask: u32,
    pub handler_ptr: PspAddr,
    pub common_arg: u32,
}

impl Default for NativeThreadEventHandler {
    fn default() -> Self {
        Self {
            size: NATIVE_THREAD_EVENT_HANDLER_SIZE as u32,
            name: [0; 32],
            thread_id: 0,
            mask: 0,
            handler_ptr: 0,
            common_arg: 0,
        }
    }
}

impl NativeThreadEventHandler {
    pub fn to_bytes(&self) -> [u8; NATIVE_THREAD_EVENT_HANDLER_SIZE] {
        let mut b = [0u8; NATIVE_THREAD_EVENT_HANDLER_SIZE];
        LittleEndian::write_u32(&mut b[0..], self.size);
        b[4..36].copy_from_slice(&self.name);
        LittleEndian::write_i32(&mut b[36..], self.thread_id);
        LittleEndian::write_u32(&mut b[40..], self.mask);
        LittleEndian::write_u32(&mut b[44..], self.handler_ptr);
        LittleEndian::write_u32(&mut b[48..], self.common_arg);
        b
    }

    pub fn from_bytes(b: &[u8; NATIVE_THREAD_EVENT_HANDLER_SIZE]) -> Self {
        let mut name = [0u8; 32];
        name.copy_from_slice(&b[4..36]);
        Self {
            size: LittleEndian::read_u32(&b[0..]),
            name,
            thread_id: LittleEndian::read_i32(&b[36..]),
            mask: LittleEndian::read_u32(&b[40..]),
            handler_ptr: LittleEndian::read_u32(&b[44..]),
            common_arg: LittleEndian::read_u32(&b[48..]),
        }
    }
}

impl Persist for NativeThreadEventHandler {
    fn persist(&mut self, p: &mut PointerWrap) {
        let mut raw = self.to_bytes();
        p.do_bytes(&mut raw);
        if p.is_reading() {
            *self = Self::from_bytes(&raw);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThreadEventHandler {
    pub uid: SceUid,
    pub nteh: NativeThreadEventHandler,
}

impl ThreadEventHandler {
    pub fn new(name: &str, thread_id: SceUid, mask: u32, handler_ptr: PspAddr, common_arg: u32) -> Self {
        Self {
            uid: 0,
            nteh: NativeThreadEventHandler {
                name: name_to_bytes(name),
                thread_id,
                mask,
                handler_ptr,
                common_arg,
                ..NativeThreadEventHandler::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        name_from_bytes(&self.nteh.name)
    }

    pub fn do_state(&mut self, p: &mut PointerWrap) {
        p.section("ThreadEventHandler", 1, 1, |p, _| {
            p.sync(&mut self.nteh);
        });
    }
}

impl KernelCore {
    /// Inject a call for every handler in `handlers` that listens to
    /// `event`. Returns whether any call was made.
    fn trigger_event_list(&mut self, handlers: &[SceUid], thread_id: SceUid, event: u32) -> bool {
        // Handlers run on the current thread, or on whoever runs next.
        let target = match self.current_thread() {
            Some(t) if !t.is_stopped() => t.uid,
            _ => self.sched.ready_queue.peek_first(),
        };
        let target = self.objects.get::<Thread>(target).ok().map(|t| t.uid);

        let mut had_handlers = false;
        for &id in handlers {
            let Ok(teh) = self.objects.get::<ThreadEventHandler>(id) else {
                continue;
            };
            if teh.nteh.mask & event == 0 {
                continue;
            }
            let args = [event, thread_id as u32, teh.nteh.common_arg];
            let entry = teh.nteh.handler_ptr;
            debug!("Thread event {:#x} for {} -> handler {}", event, thread_id, id);
            self.call_address(target, entry, None, &args, true, 0);
            had_handlers = true;
        }
        had_handlers
    }

    /// Fire `event` for `thread_id`. Wildcard handlers only see user threads.
    pub fn thread_trigger_event(&mut self, is_kernel: bool, thread_id: SceUid, event: u32) -> bool {
        let exact = self
            .sched
            .thread_event_handlers
            .get(&thread_id)
            .cloned()
            .unwrap_or_default();
        let had_exact = self.trigger_event_list(&exact, thread_id, event);

        let mut had_kind = false;
        if !is_kernel {
            let all_user = self
                .sched
                .thread_event_handlers
                .get(&THREADID_ALL_USER)
                .cloned()
                .unwrap_or_default();
            had_kind = self.trigger_event_list(&all_user, thread_id, event);
        }
        had_exact || had_kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_layout() {
        let teh = ThreadEventHandler::new("h", THREADID_ALL_USER, THREADEVENT_EXIT, 0x0880_4000, 9);
        let raw = teh.nteh.to_bytes();
        assert_eq!(LittleEndian::read_u32(&raw[0..]), 52);
        assert_eq!(LittleEndian::read_u32(&raw[36..]), 0xFFFF_FFF0);
        assert_eq!(LittleEndian::read_u32(&raw[40..]), THREADEVENT_EXIT);
        assert_eq!(NativeThreadEventHandler::from_bytes(&raw), teh.nteh);
        assert_eq!(teh.name(), "h");
    }
}
