// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rupsp_common::{error, PointerWrap, ResultCode, SceUid};

use crate::callback::Callback;
use crate::thread::Thread;
use crate::thread_events::ThreadEventHandler;

/// Kernel object type IDs, as reported by `sceKernelGetThreadmanIdType`.
pub mod tmid {
    pub const THREAD: i32 = 1;
    pub const SEMAPHORE: i32 = 2;
    pub const EVENT_FLAG: i32 = 3;
    pub const MBOX: i32 = 4;
    pub const VPL: i32 = 5;
    pub const FPL: i32 = 6;
    pub const MPIPE: i32 = 7;
    pub const CALLBACK: i32 = 8;
    pub const THREAD_EVENT_HANDLER: i32 = 9;
    pub const ALARM: i32 = 10;
    pub const VTIMER: i32 = 11;
    pub const MUTEX: i32 = 12;
    pub const LW_MUTEX: i32 = 13;
    pub const TLSPL: i32 = 14;
    pub const SLEEP_THREAD: i32 = 64;
    pub const DELAY_THREAD: i32 = 65;
    pub const SUSPEND_THREAD: i32 = 66;
    pub const DORMANT_THREAD: i32 = 67;
}

/// All kernel object types owned by the object pool.
#[derive(Debug)]
pub enum KernelObject {
    Thread(Box<Thread>),
    Callback(Callback),
    ThreadEventHandler(ThreadEventHandler),
}

impl KernelObject {
    pub fn id_type(&self) -> i32 {
        match self {
            Self::Thread(_) => tmid::THREAD,
            Self::Callback(_) => tmid::CALLBACK,
            Self::ThreadEventHandler(_) => tmid::THREAD_EVENT_HANDLER,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Thread(_) => "Thread",
            Self::Callback(_) => "CallBack",
            Self::ThreadEventHandler(_) => "ThreadEventHandler",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Thread(t) => t.name(),
            Self::Callback(c) => c.name(),
            Self::ThreadEventHandler(h) => h.name(),
        }
    }

    pub fn uid(&self) -> SceUid {
        match self {
            Self::Thread(t) => t.uid,
            Self::Callback(c) => c.uid,
            Self::ThreadEventHandler(h) => h.uid,
        }
    }

    pub(crate) fn set_uid(&mut self, uid: SceUid) {
        match self {
            Self::Thread(t) => t.uid = uid,
            Self::Callback(c) => c.uid = uid,
            Self::ThreadEventHandler(h) => h.uid = uid,
        }
    }

    /// Blank object of the given type, to be filled by a state load.
    pub fn create_by_type(id_type: i32) -> Option<Self> {
        match id_type {
            tmid::THREAD => Some(Self::Thread(Box::default())),
            tmid::CALLBACK => Some(Self::Callback(Callback::default())),
            tmid::THREAD_EVENT_HANDLER => Some(Self::ThreadEventHandler(ThreadEventHandler::default())),
            _ => None,
        }
    }

    pub fn do_state(&mut self, p: &mut PointerWrap) {
        match self {
            Self::Thread(t) => t.do_state(p),
            Self::Callback(c) => c.do_state(p),
            Self::ThreadEventHandler(h) => h.do_state(p),
        }
    }
}

/// Typed access into [`KernelObject`], used by the pool's `get<T>`.
pub trait KernelObjectType: Sized {
    const ID_TYPE: i32;
    /// Error returned when the ID is unknown or of another type.
    const MISSING_ERROR: ResultCode;

    fn from_object(obj: &KernelObject) -> Option<&Self>;
    fn from_object_mut(obj: &mut KernelObject) -> Option<&mut Self>;
}

impl KernelObjectType for Thread {
    const ID_TYPE: i32 = tmid::THREAD;
    const MISSING_ERROR: ResultCode = error::UNKNOWN_THID;

    fn from_object(obj: &KernelObject) -> Option<&Self> {
        match obj {
            KernelObject::Thread(t) => Some(t),
            _ => None,
        }
    }

    fn from_object_mut(obj: &mut KernelObject) -> Option<&mut Self> {
        match obj {
            KernelObject::Thread(t) => Some(t),
            _ => None,
        }
    }
}

impl KernelObjectType for Callback {
    const ID_TYPE: i32 = tmid::CALLBACK;
    const MISSING_ERROR: ResultCode = error::UNKNOWN_CBID;

    fn from_object(obj: &KernelObject) -> Option<&Self> {
        match obj {
            KernelObject::Callback(c) => Some(c),
            _ => None,
        }
    }

    fn from_object_mut(obj: &mut KernelObject) -> Option<&mut Self> {
        match obj {
            KernelObject::Callback(c) => Some(c),
            _ => None,
        }
    }
}

impl KernelObjectType for ThreadEventHandler {
    const ID_TYPE: i32 = tmid::THREAD_EVENT_HANDLER;
    const MISSING_ERROR: ResultCode = error::UNKNOWN_TEID;

    fn from_object(obj: &KernelObject) -> Option<&Self> {
        match obj {
            KernelObject::ThreadEventHandler(h) => Some(h),
            _ => None,
        }
    }

    fn from_object_mut(obj: &mut KernelObject) -> Option<&mut Self> {
        match obj {
            KernelObject::ThreadEventHandler(h) => Some(h),
            _ => None,
        }
    }
}
