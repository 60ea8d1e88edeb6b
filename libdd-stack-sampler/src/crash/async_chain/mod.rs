// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backtraces across asynchronous submission boundaries.
//!
//! When work is submitted through an interposed entry point, the submitter's stack is captured
//! into a node linked to the node the submitting thread is itself running under. While the work
//! runs, the executing thread is associated with that node in a fixed table, so a crash handler
//! can ask which chain of submissions led to the crashing thread.

pub mod arena;
pub mod interpose;

pub use arena::{NodeArena, NodeHandle};
pub use interpose::{EntryPoint, HookTable, InterposeError, Interposer, SubmitHook, Work};

use crate::collector::backtrace::capture_current_thread;
use crate::shared::configuration::{AsyncChainConfiguration, FrameAbi};
use crate::shared::constants::{
    ASYNC_CALLER_HASH_MULTIPLIER, ASYNC_CALLER_SLOTS, MAX_BACKTRACE_FRAMES,
};
use crate::thread::{ThreadControl, ThreadRef};
use portable_atomic::AtomicU64;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, OnceLock};

// Frames of the capture itself.
const CAPTURE_SKIP: usize = 1;

#[derive(Debug)]
struct CallerSlot {
    // 0 when free.
    thread: AtomicU64,
    node: AtomicU32,
}

/// Which node each running thread executes under. Threads hashing to an occupied slot are simply
/// not tracked.
#[derive(Debug)]
struct CallerTable {
    slots: [CallerSlot; ASYNC_CALLER_SLOTS],
}

fn slot_index(thread: ThreadRef) -> usize {
    (thread.0.wrapping_mul(ASYNC_CALLER_HASH_MULTIPLIER) % ASYNC_CALLER_SLOTS as u64) as usize
}

/// How an association changed a slot, so it can be undone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Claim {
    Fresh,
    Nested { previous: u32 },
    Collision,
}

impl CallerTable {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| CallerSlot {
                thread: AtomicU64::new(0),
                node: AtomicU32::new(NodeHandle::into_raw(None)),
            }),
        }
    }

    fn slot(&self, thread: ThreadRef) -> &CallerSlot {
        &self.slots[slot_index(thread)]
    }

    fn associate(&self, thread: ThreadRef, node: NodeHandle) -> Claim {
        let slot = self.slot(thread);
        let raw = NodeHandle::into_raw(Some(node));
        match slot.thread.compare_exchange(0, thread.0, SeqCst, SeqCst) {
            Ok(_) => {
                slot.node.store(raw, SeqCst);
                Claim::Fresh
            }
            // Work run inline by work that is itself associated with this thread.
            Err(owner) if owner == thread.0 => Claim::Nested {
                previous: slot.node.swap(raw, SeqCst),
            },
            Err(_) => Claim::Collision,
        }
    }

    fn release(&self, thread: ThreadRef, claim: Claim) {
        let slot = self.slot(thread);
        match claim {
            Claim::Fresh => {
                slot.node.store(NodeHandle::into_raw(None), SeqCst);
                let _ = slot.thread.compare_exchange(thread.0, 0, SeqCst, SeqCst);
            }
            Claim::Nested { previous } => slot.node.store(previous, SeqCst),
            Claim::Collision => {}
        }
    }

    /// Reads the slot, then re-reads the owner: the node is only trusted if the slot still belongs
    /// to `thread` afterwards.
    fn get(&self, thread: ThreadRef) -> Option<NodeHandle> {
        if thread.0 == 0 {
            return None;
        }
        let slot = self.slot(thread);
        if slot.thread.load(SeqCst) != thread.0 {
            return None;
        }
        let node = slot.node.load(SeqCst);
        if slot.thread.load(SeqCst) != thread.0 {
            return None;
        }
        NodeHandle::from_raw(node)
    }
}

struct ChainState {
    arena: NodeArena,
    callers: CallerTable,
    control: Arc<dyn ThreadControl>,
    frame_abi: FrameAbi,
}

impl ChainState {
    fn current_thread(&self) -> ThreadRef {
        self.control.current_thread().native()
    }

    /// Captures the calling thread's stack into a new node linked to the node this thread is
    /// running under. `None` when the arena is exhausted.
    #[inline(never)]
    fn capture(&self) -> Option<NodeHandle> {
        let mut frames = [0usize; MAX_BACKTRACE_FRAMES];
        let walk = capture_current_thread(&*self.control, self.frame_abi, CAPTURE_SKIP, &mut frames);
        let caller = self.callers.get(self.current_thread());
        self.arena.allocate(&frames[..walk.depth], caller)
    }
}

/// The node reference owned by a wrapped piece of work. Released when the work finishes, panics
/// or is dropped without running.
struct PendingNode {
    state: Arc<ChainState>,
    node: NodeHandle,
}

impl Drop for PendingNode {
    fn drop(&mut self) {
        self.state.arena.decref(self.node);
    }
}

/// Association of the executing thread with a node, undone on drop.
struct Association<'a> {
    state: &'a ChainState,
    thread: ThreadRef,
    claim: Claim,
}

impl Drop for Association<'_> {
    fn drop(&mut self) {
        self.state.callers.release(self.thread, self.claim);
    }
}

pub struct AsyncChainInterceptor {
    state: Arc<ChainState>,
    active: AtomicBool,
    installed: AtomicBool,
}

static GLOBAL: OnceLock<Arc<AsyncChainInterceptor>> = OnceLock::new();

impl AsyncChainInterceptor {
    pub fn new(config: &AsyncChainConfiguration, control: Arc<dyn ThreadControl>) -> Self {
        Self {
            state: Arc::new(ChainState {
                arena: NodeArena::new(config.node_capacity()),
                callers: CallerTable::new(),
                control,
                frame_abi: config.frame_abi(),
            }),
            active: AtomicBool::new(false),
            installed: AtomicBool::new(false),
        }
    }

    /// Creates the process-wide interceptor. Later calls return the existing one and ignore their
    /// arguments.
    pub fn init_global(
        config: &AsyncChainConfiguration,
        control: Arc<dyn ThreadControl>,
    ) -> &'static Arc<AsyncChainInterceptor> {
        GLOBAL.get_or_init(|| Arc::new(Self::new(config, control)))
    }

    /// The process-wide interceptor, if created. Safe to call from a signal handler.
    pub fn global() -> Option<&'static Arc<AsyncChainInterceptor>> {
        GLOBAL.get()
    }

    /// Routes every [`EntryPoint`] through this interceptor and activates it. Only the first
    /// successful call rebinds; later calls just reactivate.
    pub fn install(self: &Arc<Self>, interposer: &dyn Interposer) -> Result<(), InterposeError> {
        self.active.store(true, SeqCst);
        if self.installed.swap(true, SeqCst) {
            return Ok(());
        }
        let hook: Arc<dyn SubmitHook> = self.clone();
        for entry in EntryPoint::ALL {
            if let Err(error) = interposer.interpose(entry, hook.clone()) {
                tracing::error!(%entry, %error, "Unable to interpose async entry point");
                self.installed.store(false, SeqCst);
                self.active.store(false, SeqCst);
                return Err(error);
            }
        }
        tracing::debug!("Async call chain interception installed");
        Ok(())
    }

    /// Interposed entry points keep calling the interceptor, which now passes work through
    /// untouched.
    pub fn deactivate(&self) {
        self.active.store(false, SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Relaxed)
    }

    /// Links `work` to the calling thread's stack. Without a free node the work is returned as is.
    pub fn wrap(&self, work: Work) -> Work {
        let Some(node) = self.state.capture() else {
            tracing::debug!("Async node arena exhausted, submitting without a call chain");
            return work;
        };
        let pending = PendingNode {
            state: self.state.clone(),
            node,
        };
        Box::new(move || {
            let pending = pending;
            let state = &*pending.state;
            let thread = state.current_thread();
            let _association = Association {
                state,
                thread,
                claim: state.callers.associate(thread, pending.node),
            };
            work();
        })
    }

    /// The node the given thread is currently running under, if any.
    pub fn get_async_caller_for_thread(&self, thread: ThreadRef) -> Option<NodeHandle> {
        self.state.callers.get(thread)
    }

    /// Copies the frames of the chain `thread` runs under into `out`, innermost submission first,
    /// without taking a reference. Returns `None` if there is no chain, or if it was released while
    /// being copied.
    pub fn with_async_caller_frames(&self, thread: ThreadRef, out: &mut [usize]) -> Option<usize> {
        let head = self.state.callers.get(thread)?;
        let arena = &self.state.arena;
        let mut written = 0;
        let mut next = Some(head);
        // Bounded in case released nodes get relinked while we read.
        for _ in 0..arena.capacity() {
            let Some(node) = next else {
                break;
            };
            if written == out.len() {
                break;
            }
            written += arena.copy_frames(node, &mut out[written..]);
            next = arena.caller(node);
        }
        (self.state.callers.get(thread) == Some(head)).then_some(written)
    }

    /// Nodes currently alive.
    pub fn outstanding_nodes(&self) -> usize {
        self.state.arena.outstanding()
    }

    pub fn arena(&self) -> &NodeArena {
        &self.state.arena
    }
}

impl SubmitHook for AsyncChainInterceptor {
    fn on_submit(&self, _entry: EntryPoint, work: Work) -> Work {
        if self.is_active() {
            self.wrap(work)
        } else {
            work
        }
    }
}
