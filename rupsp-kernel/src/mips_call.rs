// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Calls from the kernel into guest code.
//!
//! A [`MipsCall`] runs a guest function on top of a thread: the caller's
//! scratch registers are pushed into a 128-byte frame under `sp`, `pc` is
//! redirected to the entry point and `ra` to the callback-return trampoline.
//! When the guest returns, the frame is popped and the call's after-action
//! restores whatever the kernel needs (wait state, callback bookkeeping).
//!
//! Actions are polymorphic but must survive savestates, so each concrete
//! action type is registered under a small integer ID at startup and only
//! that ID plus the action's fields are persisted.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, error, warn};
use rupsp_common::chunk_file::ErrorLevel;
use rupsp_common::{Persist, PointerWrap, PspAddr, SceUid};
use rupsp_cpu::state::{
    MIPS_REG_A0, MIPS_REG_RA, MIPS_REG_SP, MIPS_REG_T7, MIPS_REG_T8, MIPS_REG_T9, MIPS_REG_V0,
    MIPS_REG_V1,
};
use rupsp_cpu::{MemoryAccess, MemoryFault};

use crate::callback::Callback;
use crate::kernel::KernelCore;
use crate::scheduler::update_ready_queue;
use crate::thread::{Thread, ThreadStatus, ThreadWaitInfo, WaitType};

/// Maximum number of arguments passed in a0..t1.
pub const MAX_CALL_ARGS: usize = 6;

/// Size of the register frame pushed under the guest `sp`.
const CALL_FRAME_SIZE: u32 = 128;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Continuation run when a MIPS call returns.
pub trait Action: fmt::Debug + Send {
    fn run(&mut self, kernel: &mut KernelCore, call: &mut MipsCall);
    fn do_state(&mut self, p: &mut PointerWrap, registry: &ActionRegistry);
    fn action_type_id(&self) -> i32;
    fn set_action_type_id(&mut self, id: i32);
}

/// Builds a blank action for a state load.
pub type ActionCreator = fn() -> Box<dyn Action>;

/// Maps action type IDs to constructors. ID 0 means "no action".
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    types: Vec<Option<ActionCreator>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self { types: vec![None] }
    }

    pub fn register(&mut self, creator: ActionCreator) -> i32 {
        self.types.push(Some(creator));
        (self.types.len() - 1) as i32
    }

    /// Bind a saved ID to its constructor.
    pub fn restore(&mut self, id: i32, creator: ActionCreator) {
        let Ok(idx) = usize::try_from(id) else {
            warn!("Ignoring restore of invalid action type {}", id);
            return;
        };
        if idx == 0 {
            warn!("Action type 0 is reserved");
            return;
        }
        if self.types.len() <= idx {
            self.types.resize(idx + 1, None);
        }
        self.types[idx] = Some(creator);
    }

    pub fn create(&self, id: i32) -> Option<Box<dyn Action>> {
        let creator = usize::try_from(id)
            .ok()
            .and_then(|i| self.types.get(i))
            .copied()
            .flatten()?;
        let mut action = creator();
        action.set_action_type_id(id);
        Some(action)
    }

    pub fn clear(&mut self) {
        self.types = vec![None];
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Persist an optional action as its type ID followed by its state.
fn do_action_state(
    p: &mut PointerWrap,
    action: &mut Option<Box<dyn Action>>,
    registry: &ActionRegistry,
) {
    let mut type_id = action.as_ref().map_or(0, |a| a.action_type_id());
    p.sync(&mut type_id);
    if type_id == 0 {
        if p.is_reading() {
            *action = None;
        }
        return;
    }
    if p.is_reading() {
        *action = registry.create(type_id);
        if action.is_none() {
            p.set_error(
                ErrorLevel::Failure,
                &format!("unknown action type {} in state", type_id),
            );
            return;
        }
    }
    if let Some(a) = action.as_mut() {
        a.do_state(p, registry);
    }
}

// ---------------------------------------------------------------------------
// MipsCall
// ---------------------------------------------------------------------------

/// One injected call into guest code.
#[derive(Debug, Default)]
pub struct MipsCall {
    pub entry_point: PspAddr,
    /// Callback being delivered, 0 for internal calls.
    pub cb_id: SceUid,
    pub args: [u32; MAX_CALL_ARGS],
    pub num_args: i32,
    pub saved_pc: u32,
    pub saved_v0: u32,
    pub saved_v1: u32,
    pub tag: String,
    /// MIPS call that was active on the thread before this one.
    pub saved_id: u32,
    pub resched_after: bool,
    pub do_after: Option<Box<dyn Action>>,
}

impl MipsCall {
    /// Value the interrupted code sees in v0 once the call returns.
    pub fn set_return_value(&mut self, value: u32) {
        self.saved_v0 = value;
    }

    pub fn set_return_value_u64(&mut self, value: u64) {
        self.saved_v0 = value as u32;
        self.saved_v1 = (value >> 32) as u32;
    }

    pub fn do_state(&mut self, p: &mut PointerWrap, registry: &ActionRegistry) {
        p.section("MipsCall", 1, 1, |p, _| {
            p.sync(&mut self.entry_point);
            p.sync(&mut self.cb_id);
            p.sync(&mut self.args);
            p.sync(&mut self.num_args);
            // Used to hold saved registers, now kept on the guest stack.
            let mut legacy = [0u32; 2];
            p.sync(&mut legacy);
            p.sync(&mut self.saved_pc);
            p.sync(&mut self.saved_v0);
            p.sync(&mut self.saved_v1);
            p.sync(&mut self.tag);
            p.sync(&mut self.saved_id);
            p.sync(&mut self.resched_after);
            do_action_state(p, &mut self.do_after, registry);
        });
    }
}

/// Owns every in-flight MIPS call and the action type registry.
#[derive(Debug, Default)]
pub struct MipsCallManager {
    calls: BTreeMap<u32, MipsCall>,
    id_gen: u32,
    pub registry: ActionRegistry,
}

impl MipsCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, call: MipsCall) -> u32 {
        self.id_gen = self.id_gen.wrapping_add(1);
        let id = self.id_gen;
        self.calls.insert(id, call);
        id
    }

    pub fn get(&self, id: u32) -> Option<&MipsCall> {
        self.calls.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut MipsCall> {
        self.calls.get_mut(&id)
    }

    pub fn pop(&mut self, id: u32) -> Option<MipsCall> {
        self.calls.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
        self.id_gen = 0;
    }

    pub fn do_state(&mut self, p: &mut PointerWrap) {
        let Self {
            calls,
            id_gen,
            registry,
        } = self;
        p.section("MipsCallManager", 1, 1, |p, _| {
            let mut count = calls.len() as u32;
            p.sync(&mut count);
            if p.is_reading() {
                calls.clear();
                for _ in 0..count {
                    let mut id = 0u32;
                    p.sync(&mut id);
                    let mut call = MipsCall::default();
                    call.do_state(p, registry);
                    calls.insert(id, call);
                }
            } else {
                for (&id, call) in calls.iter_mut() {
                    let mut id = id;
                    p.sync(&mut id);
                    call.do_state(p, registry);
                }
            }
            p.sync(id_gen);
        });
    }
}

// ---------------------------------------------------------------------------
// Concrete actions
// ---------------------------------------------------------------------------

/// Restores a thread's wait state once a call injected on it returns.
#[derive(Debug, Default)]
pub struct ActionAfterMipsCall {
    action_type_id: i32,
    pub thread_id: SceUid,
    pub status: ThreadStatus,
    pub wait_type: WaitType,
    pub wait_id: SceUid,
    pub wait_info: ThreadWaitInfo,
    pub is_processing_callbacks: bool,
    pub current_callback_id: SceUid,
    pub chained_action: Option<Box<dyn Action>>,
}

impl ActionAfterMipsCall {
    pub fn create() -> Box<dyn Action> {
        Box::new(Self::default())
    }

    /// Snapshot `thread` so it can be put back the way it was.
    pub fn snapshot(type_id: i32, thread: &Thread, chained: Option<Box<dyn Action>>) -> Self {
        Self {
            action_type_id: type_id,
            thread_id: thread.uid,
            status: thread.nt.status,
            wait_type: thread.nt.wait_type,
            wait_id: thread.nt.wait_id,
            wait_info: thread.wait_info,
            is_processing_callbacks: thread.is_processing_callbacks,
            current_callback_id: thread.current_callback_id,
            chained_action: chained,
        }
    }
}

impl Action for ActionAfterMipsCall {
    fn run(&mut self, kernel: &mut KernelCore, call: &mut MipsCall) {
        if let Ok(thread) = kernel.objects.get_mut::<Thread>(self.thread_id) {
            // The thread may have exited inside the call; leave it stopped.
            if !thread.is_stopped() {
                update_ready_queue(
                    &mut kernel.sched.ready_queue,
                    thread,
                    self.status.contains(ThreadStatus::READY),
                );
                thread.nt.status = self.status;
            }
            thread.nt.wait_type = self.wait_type;
            thread.nt.wait_id = self.wait_id;
            thread.wait_info = self.wait_info;
            thread.is_processing_callbacks = self.is_processing_callbacks;
            thread.current_callback_id = self.current_callback_id;
        }

        if let Some(mut chained) = self.chained_action.take() {
            chained.run(kernel, call);
        }
    }

    fn do_state(&mut self, p: &mut PointerWrap, registry: &ActionRegistry) {
        let Self {
            thread_id,
            status,
            wait_type,
            wait_id,
            wait_info,
            is_processing_callbacks,
            current_callback_id,
            chained_action,
            ..
        } = self;
        p.section("ActionAfterMipsCall", 1, 1, |p, _| {
            p.sync(thread_id);
            let mut raw_status = status.bits();
            p.sync(&mut raw_status);
            let mut raw_wait = *wait_type as u32;
            p.sync(&mut raw_wait);
            if p.is_reading() {
                *status = ThreadStatus::from_bits_retain(raw_status);
                *wait_type = WaitType::from_raw(raw_wait);
            }
            p.sync(wait_id);
            p.sync(wait_info);
            p.sync(is_processing_callbacks);
            p.sync(current_callback_id);
            do_action_state(p, chained_action, registry);
        });
    }

    fn action_type_id(&self) -> i32 {
        self.action_type_id
    }

    fn set_action_type_id(&mut self, id: i32) {
        self.action_type_id = id;
    }
}

/// Runs after a guest callback returns: re-checks the owner's callbacks and
/// deletes the callback if it returned nonzero.
#[derive(Debug)]
pub struct ActionAfterCallback {
    action_type_id: i32,
    pub cb_id: SceUid,
}

impl Default for ActionAfterCallback {
    fn default() -> Self {
        Self {
            action_type_id: 0,
            cb_id: -1,
        }
    }
}

impl ActionAfterCallback {
    pub fn new(type_id: i32, cb_id: SceUid) -> Self {
        Self {
            action_type_id: type_id,
            cb_id,
        }
    }

    pub fn create() -> Box<dyn Action> {
        Box::new(Self::default())
    }
}

impl Action for ActionAfterCallback {
    fn run(&mut self, kernel: &mut KernelCore, _call: &mut MipsCall) {
        if self.cb_id == -1 {
            return;
        }
        let Ok(cb) = kernel.objects.get::<Callback>(self.cb_id) else {
            return;
        };
        let owner = cb.nc.thread_id;
        debug!("Left callback {} - {}", self.cb_id, cb.name());

        if kernel.objects.get::<Thread>(owner).is_ok() {
            kernel.check_thread_callbacks(owner, true);
        }

        // A nonzero return asks for the callback to be deleted.
        if kernel.cpu.r[MIPS_REG_V0] != 0 {
            debug!("ActionAfterCallback::run(): callback returned non-zero, gets deleted");
            if let Err(rc) = kernel.destroy_callback(self.cb_id) {
                warn!("Callback {} already gone: {}", self.cb_id, rc);
            }
        }
    }

    fn do_state(&mut self, p: &mut PointerWrap, _registry: &ActionRegistry) {
        p.section("ActionAfterCallback", 1, 1, |p, _| {
            p.sync(&mut self.cb_id);
        });
    }

    fn action_type_id(&self) -> i32 {
        self.action_type_id
    }

    fn set_action_type_id(&mut self, id: i32) {
        self.action_type_id = id;
    }
}

// ---------------------------------------------------------------------------
// Injection engine
// ---------------------------------------------------------------------------

/// Registers saved in the call frame, in frame order.
fn frame_registers() -> impl Iterator<Item = usize> {
    (MIPS_REG_A0..=MIPS_REG_T7).chain([MIPS_REG_T8, MIPS_REG_T9, MIPS_REG_RA])
}

impl KernelCore {
    /// Run `entry` on `thread` (or the current thread for `None`).
    ///
    /// The thread's wait state is snapshotted and restored when the call
    /// returns. The call runs right away when the target is current and no
    /// callback is active, otherwise it is queued on the thread.
    pub fn call_address(
        &mut self,
        thread: Option<SceUid>,
        entry: PspAddr,
        after: Option<Box<dyn Action>>,
        args: &[u32],
        resched_after: bool,
        cb_id: SceUid,
    ) {
        let thread_id = thread.filter(|&id| self.objects.get::<Thread>(id).is_ok());
        match thread_id.and_then(|id| self.objects.get::<Thread>(id).ok()) {
            Some(t) if !t.is_stopped() => {}
            _ => warn!("Running mipscall on dormant thread"),
        }

        if args.len() > MAX_CALL_ARGS {
            self.report(format!("Too many arguments to a mipscall: {}", args.len()));
        }
        let num_args = args.len().min(MAX_CALL_ARGS);

        let mut do_after = after;
        if let Some(id) = thread_id {
            let (wait_type, prev_cb) = match self.objects.get::<Thread>(id) {
                Ok(t) => {
                    let snapshot =
                        ActionAfterMipsCall::snapshot(self.sched.action_after_mips_call, t, do_after.take());
                    do_after = Some(Box::new(snapshot));
                    (t.nt.wait_type, t.current_callback_id)
                }
                Err(_) => (WaitType::None, 0),
            };

            if wait_type != WaitType::None {
                if cb_id > 0 {
                    let funcs = self.sched.wait_type_funcs[wait_type as usize];
                    match funcs {
                        Some(funcs) => (funcs.begin)(self, id, prev_cb),
                        None => self.report(format!(
                            "Missing begin callback for wait type {}",
                            wait_type.name()
                        )),
                    }
                }
                if let Ok(t) = self.objects.get_mut::<Thread>(id) {
                    t.nt.wait_type = WaitType::None;
                }
            }
            self.change_thread_state(id, ThreadStatus::READY);
        }

        let mut call = MipsCall {
            entry_point: entry,
            cb_id,
            num_args: num_args as i32,
            do_after,
            tag: "callAddress".to_string(),
            ..MipsCall::default()
        };
        call.args[..num_args].copy_from_slice(&args[..num_args]);
        let call_id = self.mips_calls.add(call);

        let current = self.sched.current_thread;
        let mut called = false;
        if (thread_id.is_none() || thread_id == Some(current)) && self.sched.in_cb_count == 0 {
            self.change_thread_state(current, ThreadStatus::RUNNING);
            called = self.execute_mips_call_on_current_thread(call_id, resched_after);
        }

        if !called {
            match thread_id.and_then(|id| self.objects.get_mut::<Thread>(id).ok()) {
                Some(t) => {
                    debug!("Making mipscall pending on thread {}", t.uid);
                    t.pending_mips_calls.push_back(call_id);
                }
                None => {
                    warn!("Ignoring mispcall on NULL/deleted thread");
                    self.mips_calls.pop(call_id);
                }
            }
        }
    }

    /// Push a call frame on the current thread and jump to the call.
    pub(crate) fn execute_mips_call_on_current_thread(&mut self, call_id: u32, resched_after: bool) -> bool {
        let cur_id = self.sched.current_thread;
        let Ok(cur) = self.objects.get::<Thread>(cur_id) else {
            error!("__KernelExecuteMipsCallOnCurrentThread: Bad current thread");
            return false;
        };
        let prev_call = cur.current_mipscall_id;

        if self.sched.in_cb_count > 0 {
            warn!("__KernelExecuteMipsCallOnCurrentThread: Already in a callback!");
        }
        debug!("Executing mipscall {} on thread {}", call_id, cur_id);

        let frame = self.cpu.r[MIPS_REG_SP].wrapping_sub(CALL_FRAME_SIZE);
        if !self.memory.ram.is_valid_range(frame, CALL_FRAME_SIZE) {
            self.report(format!(
                "Not enough free stack to run mipscall at {:08x}",
                frame
            ));
            return false;
        }

        let Some(call) = self.mips_calls.get_mut(call_id) else {
            error!("Unknown mipscall {}", call_id);
            return false;
        };

        let saved: Result<(), MemoryFault> = frame_registers()
            .try_for_each(|reg| self.memory.ram.write_u32(frame + reg as u32 * 4, self.cpu.r[reg]));
        if let Err(e) = saved {
            error!("Could not save registers for mipscall: {}", e);
            return false;
        }
        self.cpu.r[MIPS_REG_SP] = frame;

        call.saved_pc = self.cpu.pc;
        call.saved_v0 = self.cpu.r[MIPS_REG_V0];
        call.saved_v1 = self.cpu.r[MIPS_REG_V1];
        call.saved_id = prev_call;
        call.resched_after = resched_after;

        self.cpu.pc = call.entry_point;
        self.cpu.r[MIPS_REG_RA] = self.sched.hacks.callback_return;
        let num_args = usize::try_from(call.num_args).unwrap_or(0).min(MAX_CALL_ARGS);
        for (i, &arg) in call.args[..num_args].iter().enumerate() {
            self.cpu.r[MIPS_REG_A0 + i] = arg;
        }
        let is_callback = call.cb_id != 0;

        if let Ok(cur) = self.objects.get_mut::<Thread>(cur_id) {
            cur.current_mipscall_id = call_id;
        }
        if is_callback {
            self.sched.in_cb_count += 1;
        }
        self.sched.current_callback_thread = cur_id;
        true
    }

    /// Guest returned from a MIPS call: run its action, pop the register
    /// frame and continue with pending calls or a reschedule.
    pub fn return_from_mips_call(&mut self) {
        let cur_id = self.sched.current_thread;
        let Ok(cur) = self.objects.get::<Thread>(cur_id) else {
            error!("__KernelReturnFromMipsCall(): Bad current thread");
            return;
        };
        let call_id = cur.current_mipscall_id;
        let Some(mut call) = self.mips_calls.pop(call_id) else {
            self.report(format!("Returning from unknown mipscall {}", call_id));
            return;
        };

        debug!(
            "Returned from mipscall {} ({}), v0 = {:08x}",
            call_id, call.tag, self.cpu.r[MIPS_REG_V0]
        );

        if let Some(mut after) = call.do_after.take() {
            after.run(self, &mut call);
        }

        let frame = self.cpu.r[MIPS_REG_SP];
        for reg in frame_registers() {
            match self.memory.ram.read_u32(frame + reg as u32 * 4) {
                Ok(value) => self.cpu.r[reg] = value,
                Err(e) => {
                    error!("Could not restore registers after mipscall: {}", e);
                    break;
                }
            }
        }
        self.cpu.r[MIPS_REG_SP] = frame.wrapping_add(CALL_FRAME_SIZE);

        self.cpu.pc = call.saved_pc;
        self.cpu.r[MIPS_REG_V0] = call.saved_v0;
        self.cpu.r[MIPS_REG_V1] = call.saved_v1;
        if let Ok(cur) = self.objects.get_mut::<Thread>(cur_id) {
            cur.current_mipscall_id = call.saved_id;
        }

        if call.cb_id != 0 && self.sched.in_cb_count > 0 {
            self.sched.in_cb_count -= 1;
        }
        self.sched.current_callback_thread = 0;

        // The wait was restored by the action; let it resume.
        let (wait_type, prev_cb) = self
            .objects
            .get::<Thread>(cur_id)
            .map_or((WaitType::None, 0), |t| (t.nt.wait_type, t.current_callback_id));
        if wait_type != WaitType::None && call.cb_id > 0 {
            let funcs = self.sched.wait_type_funcs[wait_type as usize];
            match funcs {
                Some(funcs) => (funcs.end)(self, cur_id, prev_cb),
                None => self.report(format!(
                    "Missing end callback for wait type {}",
                    wait_type.name()
                )),
            }
        }

        if !self.execute_pending_mips_calls(cur_id, call.resched_after) {
            let still_runnable = self
                .objects
                .get::<Thread>(cur_id)
                .is_ok_and(|t| t.nt.status.intersects(ThreadStatus::READY | ThreadStatus::RUNNING));
            if call.resched_after || !still_runnable {
                self.reschedule("return from callback");
            }

            for id in std::mem::take(&mut self.sched.pending_delete_threads) {
                if let Err(rc) = self.objects.destroy::<Thread>(id) {
                    warn!("Deferred delete of thread {} failed: {}", id, rc);
                }
            }
        }
    }

    /// Start the next queued call of `thread_id`, if it may run now.
    pub fn execute_pending_mips_calls(&mut self, thread_id: SceUid, resched_after: bool) -> bool {
        let can_run = self.sched.in_cb_count == 0;
        let Ok(thread) = self.objects.get_mut::<Thread>(thread_id) else {
            return false;
        };
        if thread.pending_mips_calls.is_empty() || !can_run {
            return false;
        }
        let Some(call_id) = thread.pending_mips_calls.pop_front() else {
            return false;
        };
        self.execute_mips_call_on_current_thread(call_id, resched_after)
    }
}
