// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread names readable from a crash handler.
//!
//! A background thread periodically rebuilds an immutable [`ThreadSnapshot`] and publishes it in
//! the `active` slot. A crash handler calls [`ThreadNameCache::freeze`], which moves the active
//! snapshot into the `frozen` slot, and then reads names from there without locks or allocation.
//!
//! Both slots hold either null or a pointer obtained from `Box::into_raw`. Ownership only moves
//! through `swap` and `compare_exchange`, so at any time each snapshot is owned by exactly one of:
//! the active slot, the frozen slot, or the thread that just took it out of a slot. The two slots
//! never point to the same allocation.

use crate::collector::metadata_cache::truncate_name;
use crate::shared::configuration::ThreadNameCacheConfiguration;
use crate::shared::constants::{MAX_THREAD_NAME_LEN, NAME_CACHE_THREAD_NAME};
use crate::thread::{ThreadControl, ThreadControlError, ThreadRef};
use std::ffi::CString;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ThreadNameCacheError {
    #[error("Failed to spawn the thread name refresher: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Failed to build a thread snapshot: {0}")]
    Snapshot(#[from] ThreadControlError),
}

/// Names of every thread at one point in time. Never mutated after construction.
#[derive(Debug)]
pub struct ThreadSnapshot {
    threads: Box<[ThreadRef]>,
    names: Box<[Option<CString>]>,
}

impl ThreadSnapshot {
    pub fn build(control: &dyn ThreadControl) -> Result<Self, ThreadControlError> {
        let handles = control.threads()?;
        let threads = handles.iter().map(|h| h.native()).collect();
        let names = handles
            .iter()
            .map(|handle| {
                let name = control.thread_name(handle).ok()?;
                if name.is_empty() {
                    return None;
                }
                CString::new(truncate_name(name, MAX_THREAD_NAME_LEN)).ok()
            })
            .collect();
        Ok(Self { threads, names })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Linear scan. Does not allocate.
    pub fn name_of(&self, thread: ThreadRef) -> Option<&CString> {
        let idx = self.threads.iter().position(|t| *t == thread)?;
        self.names.get(idx)?.as_ref()
    }
}

/// What a refresh did with the snapshot it built.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The active slot was empty and had never held a snapshot.
    Installed,
    /// The previous active snapshot was replaced and freed.
    Replaced,
    /// A crash handler holds the snapshot; the new one was discarded.
    SkippedFrozen,
    /// The active slot changed under us; the new one was discarded.
    LostRace,
}

#[derive(Debug, Default)]
struct SnapshotSlots {
    active: AtomicPtr<ThreadSnapshot>,
    frozen: AtomicPtr<ThreadSnapshot>,
    // Distinguishes "active is null because it is frozen" from "nothing was built yet".
    ever_created: AtomicBool,
    live: AtomicUsize,
}

impl SnapshotSlots {
    fn into_raw(&self, snapshot: ThreadSnapshot) -> *mut ThreadSnapshot {
        self.live.fetch_add(1, SeqCst);
        Box::into_raw(Box::new(snapshot))
    }

    /// # Safety
    /// `snapshot` must be null or come from [`Self::into_raw`], and be owned by the caller: it was
    /// just taken out of a slot, or never put into one.
    unsafe fn free(&self, snapshot: *mut ThreadSnapshot) {
        if !snapshot.is_null() {
            drop(Box::from_raw(snapshot));
            self.live.fetch_sub(1, SeqCst);
        }
    }

    fn install(&self, snapshot: ThreadSnapshot) -> RefreshOutcome {
        let new = self.into_raw(snapshot);
        let expected = self.active.load(SeqCst);
        if expected.is_null() {
            if self.ever_created.load(SeqCst) || !self.frozen.load(SeqCst).is_null() {
                // Safety: `new` was never published.
                unsafe { self.free(new) };
                return RefreshOutcome::SkippedFrozen;
            }
            return match self
                .active
                .compare_exchange(ptr::null_mut(), new, SeqCst, SeqCst)
            {
                Ok(_) => {
                    self.ever_created.store(true, SeqCst);
                    RefreshOutcome::Installed
                }
                Err(_) => {
                    // Safety: the exchange failed, so `new` was never published.
                    unsafe { self.free(new) };
                    RefreshOutcome::LostRace
                }
            };
        }
        match self.active.compare_exchange(expected, new, SeqCst, SeqCst) {
            Ok(previous) => {
                // Safety: the exchange moved `previous` out of the active slot; we own it.
                unsafe { self.free(previous) };
                RefreshOutcome::Replaced
            }
            Err(_) => {
                // Safety: the exchange failed, so `new` was never published.
                unsafe { self.free(new) };
                RefreshOutcome::LostRace
            }
        }
    }

    fn freeze(&self) {
        let snapshot = self.active.swap(ptr::null_mut(), SeqCst);
        // A nested freeze finds the active slot empty and must keep the outer frozen snapshot.
        if !snapshot.is_null() {
            self.frozen.store(snapshot, SeqCst);
        }
    }

    fn unfreeze(&self) {
        let snapshot = self.frozen.swap(ptr::null_mut(), SeqCst);
        if snapshot.is_null() {
            return;
        }
        if self
            .active
            .compare_exchange(ptr::null_mut(), snapshot, SeqCst, SeqCst)
            .is_err()
        {
            // A fresher snapshot was installed meanwhile.
            // Safety: taken out of the frozen slot and not republished.
            unsafe { self.free(snapshot) };
        }
    }

    fn clear(&self) {
        // Safety: each pointer is moved out of its slot before being freed.
        unsafe {
            self.free(self.active.swap(ptr::null_mut(), SeqCst));
            self.free(self.frozen.swap(ptr::null_mut(), SeqCst));
        }
        self.ever_created.store(false, SeqCst);
    }
}

impl Drop for SnapshotSlots {
    fn drop(&mut self) {
        self.clear();
    }
}

struct Refresher {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Crash-safe thread name cache. See the module documentation for the ownership protocol.
#[derive(Default)]
pub struct ThreadNameCache {
    slots: Arc<SnapshotSlots>,
    started: AtomicBool,
    refresher: Mutex<Option<Refresher>>,
}

static GLOBAL: OnceLock<ThreadNameCache> = OnceLock::new();

impl ThreadNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache. Initializes it on first use.
    pub fn global() -> &'static ThreadNameCache {
        GLOBAL.get_or_init(ThreadNameCache::new)
    }

    /// The process-wide cache if it exists. Never allocates: use this from signal handlers.
    pub fn try_global() -> Option<&'static ThreadNameCache> {
        GLOBAL.get()
    }

    /// Builds a first snapshot and starts refreshing in the background. Does nothing if the cache
    /// is already started.
    pub fn init(
        &self,
        config: ThreadNameCacheConfiguration,
        control: Arc<dyn ThreadControl>,
    ) -> Result<(), ThreadNameCacheError> {
        let mut refresher = match self.refresher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if refresher.is_some() {
            return Ok(());
        }
        if let Err(error) = self.refresh_now(&*control) {
            tracing::warn!(%error, "Unable to build the initial thread name snapshot");
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let slots = self.slots.clone();
        let handle = std::thread::Builder::new()
            .name(NAME_CACHE_THREAD_NAME.to_string())
            .spawn(move || {
                let mut refresh = 0u32;
                loop {
                    match stop_rx.recv_timeout(config.interval_before(refresh)) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    refresh = refresh.saturating_add(1);
                    match ThreadSnapshot::build(&*control) {
                        Ok(snapshot) => {
                            let outcome = slots.install(snapshot);
                            tracing::trace!(?outcome, "Refreshed thread names");
                        }
                        Err(error) => {
                            tracing::debug!(%error, "Keeping the previous thread name snapshot");
                        }
                    }
                }
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!(%error, "Unable to start the thread name refresher");
                return Err(error.into());
            }
        };
        *refresher = Some(Refresher {
            stop: stop_tx,
            handle,
        });
        self.started.store(true, SeqCst);
        Ok(())
    }

    /// Builds a snapshot and publishes it now. On failure the current snapshot is kept.
    pub fn refresh_now(
        &self,
        control: &dyn ThreadControl,
    ) -> Result<RefreshOutcome, ThreadNameCacheError> {
        let snapshot = ThreadSnapshot::build(control)?;
        Ok(self.slots.install(snapshot))
    }

    /// Takes ownership of the active snapshot for name lookups. Lock and allocation free.
    pub fn freeze(&self) {
        self.slots.freeze();
    }

    /// Hands the frozen snapshot back, or frees it if a newer one is active.
    pub fn unfreeze(&self) {
        self.slots.unfreeze();
    }

    /// Copies the name of `thread` from the frozen snapshot into `buf`, truncating on a character
    /// boundary. Returns `None` if the cache is not frozen or the thread has no name.
    ///
    /// Lock and allocation free. Must not race with [`Self::unfreeze`] or [`Self::close`], which is
    /// the case when both are called by the crash handler that froze the cache.
    pub fn get_thread_name<'a>(&self, thread: ThreadRef, buf: &'a mut [u8]) -> Option<&'a str> {
        let snapshot = self.slots.frozen.load(SeqCst);
        if snapshot.is_null() {
            return None;
        }
        // Safety: the frozen slot only holds live snapshots, and only unfreeze/close free them.
        let name = unsafe { &*snapshot }.name_of(thread)?.as_bytes();
        let len = name.len().min(buf.len());
        buf[..len].copy_from_slice(&name[..len]);
        match std::str::from_utf8(&buf[..len]) {
            Ok(name) => Some(name),
            Err(error) => std::str::from_utf8(&buf[..error.valid_up_to()]).ok(),
        }
    }

    /// Dispatch queue labels are not tracked; always `None`.
    pub fn get_queue_name(&self, _thread: ThreadRef) -> Option<&'static str> {
        None
    }

    /// Stops the refresher, if any, and frees both snapshots.
    pub fn close(&self) {
        let refresher = match self.refresher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.started.store(false, SeqCst);
        if let Some(Refresher { stop, handle }) = refresher {
            let _ = stop.send(());
            drop(stop);
            if handle.join().is_err() {
                tracing::error!("Thread name refresher panicked");
            }
        }
        self.slots.clear();
    }

    pub fn has_started(&self) -> bool {
        self.started.load(SeqCst)
    }

    /// Snapshots currently allocated by this cache.
    pub fn live_snapshots(&self) -> usize {
        self.slots.live.load(SeqCst)
    }
}

impl Drop for ThreadNameCache {
    fn drop(&mut self) {
        self.close();
    }
}
