// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routing of "submit work for later" entry points through a hook.
//!
//! Rebinding symbols in loaded images is platform specific, so it sits behind [`Interposer`].
//! [`HookTable`] is the in-process implementation: executors call [`HookTable::submit`] with the
//! work they were handed and schedule whatever comes back.

use std::fmt;
use std::sync::{Arc, RwLock};

/// A unit of work submitted for asynchronous execution.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Entry points that are routed through a [`SubmitHook`]. The `_and_wait` variants are not listed:
/// they may run the work on the submitting thread's stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    DispatchAsync,
    DispatchAsyncF,
    DispatchAfter,
    DispatchAfterF,
    DispatchBarrierAsync,
    DispatchBarrierAsyncF,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 6] = [
        EntryPoint::DispatchAsync,
        EntryPoint::DispatchAsyncF,
        EntryPoint::DispatchAfter,
        EntryPoint::DispatchAfterF,
        EntryPoint::DispatchBarrierAsync,
        EntryPoint::DispatchBarrierAsyncF,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            EntryPoint::DispatchAsync => "dispatch_async",
            EntryPoint::DispatchAsyncF => "dispatch_async_f",
            EntryPoint::DispatchAfter => "dispatch_after",
            EntryPoint::DispatchAfterF => "dispatch_after_f",
            EntryPoint::DispatchBarrierAsync => "dispatch_barrier_async",
            EntryPoint::DispatchBarrierAsyncF => "dispatch_barrier_async_f",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InterposeError {
    #[error("Entry point {0} is not available on this platform")]
    Unsupported(EntryPoint),
    #[error("Failed to rebind {entry}: {reason}")]
    Rebind { entry: EntryPoint, reason: String },
    #[error("Hook table lock poisoned")]
    Poisoned,
}

/// Called by an interposed entry point with the submitted work; returns the work to schedule.
pub trait SubmitHook: Send + Sync {
    fn on_submit(&self, entry: EntryPoint, work: Work) -> Work;
}

/// Platform capability that routes an entry point through a hook. Routing cannot be undone.
pub trait Interposer {
    fn interpose(&self, entry: EntryPoint, hook: Arc<dyn SubmitHook>)
        -> Result<(), InterposeError>;
}

type HookSlots = [Option<Arc<dyn SubmitHook>>; EntryPoint::ALL.len()];

#[derive(Default)]
pub struct HookTable {
    hooks: RwLock<HookSlots>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes `work` through the hook installed for `entry`, if any.
    pub fn submit(&self, entry: EntryPoint, work: Work) -> Work {
        let hook = match self.hooks.read() {
            Ok(hooks) => hooks[entry.slot()].clone(),
            Err(_) => None,
        };
        match hook {
            Some(hook) => hook.on_submit(entry, work),
            None => work,
        }
    }

    pub fn is_interposed(&self, entry: EntryPoint) -> bool {
        self.hooks
            .read()
            .map(|hooks| hooks[entry.slot()].is_some())
            .unwrap_or(false)
    }
}

impl Interposer for HookTable {
    fn interpose(
        &self,
        entry: EntryPoint,
        hook: Arc<dyn SubmitHook>,
    ) -> Result<(), InterposeError> {
        let mut hooks = self.hooks.write().map_err(|_| InterposeError::Poisoned)?;
        hooks[entry.slot()] = Some(hook);
        Ok(())
    }
}
