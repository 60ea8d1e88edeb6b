// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A simulated process for tests and benches: threads with scripted metadata, registers and
//! synthetic stacks laid out in a sparse word map.

use super::{
    MemoryReader, RegisterState, StackBounds, StackRegions, ThreadControl, ThreadControlError,
    ThreadHandle, ThreadRef,
};
use portable_atomic::AtomicU64;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::RwLock;

const WORD: usize = std::mem::size_of::<usize>();

#[derive(Debug, Clone)]
pub struct FakeThread {
    pub tid: u64,
    pub name: String,
    pub priority: i32,
    pub idle: bool,
    pub registers: RegisterState,
    pub stack: StackBounds,
    pub fail_suspend: bool,
}

impl FakeThread {
    pub fn new(tid: u64, name: &str) -> Self {
        Self {
            tid,
            name: name.to_string(),
            priority: 31,
            idle: false,
            registers: RegisterState::default(),
            stack: StackBounds::INVALID,
            fail_suspend: false,
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle::new(ThreadRef(self.tid), self.tid)
    }
}

/// Sparse memory. Addresses inside a mapped region read as their stored value or 0; everything
/// else is unreadable.
#[derive(Debug, Default)]
pub struct FakeMemory {
    regions: RwLock<Vec<StackBounds>>,
    words: RwLock<BTreeMap<usize, usize>>,
    reads: AtomicUsize,
    min_read: AtomicUsize,
    max_read: AtomicUsize,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            min_read: AtomicUsize::new(usize::MAX),
            ..Default::default()
        }
    }

    pub fn map(&self, region: StackBounds) {
        if let Ok(mut regions) = self.regions.write() {
            regions.push(region);
        }
    }

    pub fn write(&self, addr: usize, value: usize) {
        if let Ok(mut words) = self.words.write() {
            words.insert(addr, value);
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Relaxed)
    }

    /// Lowest and highest addresses read since the last reset, if any.
    pub fn read_range(&self) -> Option<(usize, usize)> {
        (self.reads() > 0).then(|| (self.min_read.load(Relaxed), self.max_read.load(Relaxed)))
    }

    pub fn reset_stats(&self) {
        self.reads.store(0, Relaxed);
        self.min_read.store(usize::MAX, Relaxed);
        self.max_read.store(0, Relaxed);
    }
}

impl MemoryReader for FakeMemory {
    fn read_word(&self, addr: usize) -> Option<usize> {
        self.reads.fetch_add(1, Relaxed);
        self.min_read.fetch_min(addr, Relaxed);
        self.max_read.fetch_max(addr, Relaxed);
        if addr % WORD != 0 {
            return None;
        }
        let mapped = self.regions.read().ok()?.iter().any(|r| {
            r.contains(addr) && addr.checked_add(WORD).is_some_and(|end| end <= r.high)
        });
        if !mapped {
            return None;
        }
        Some(self.words.read().ok()?.get(&addr).copied().unwrap_or(0))
    }
}

pub struct FakeThreadControl {
    current: u64,
    threads: RwLock<Vec<FakeThread>>,
    memory: FakeMemory,
    fail_enumeration: std::sync::atomic::AtomicBool,
    suspended: AtomicU64,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl FakeThreadControl {
    /// `current` is the tid reported for the calling thread, whichever real thread calls.
    pub fn new(current: u64) -> Self {
        Self {
            current,
            threads: RwLock::new(Vec::new()),
            memory: FakeMemory::new(),
            fail_enumeration: Default::default(),
            suspended: Default::default(),
            suspends: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        }
    }

    pub fn add_thread(&self, thread: FakeThread) -> ThreadHandle {
        let handle = thread.handle();
        if thread.stack.is_valid() {
            self.memory.map(thread.stack);
        }
        if let Ok(mut threads) = self.threads.write() {
            threads.retain(|t| t.tid != thread.tid);
            threads.push(thread);
        }
        handle
    }

    pub fn remove_thread(&self, tid: u64) {
        if let Ok(mut threads) = self.threads.write() {
            threads.retain(|t| t.tid != tid);
        }
    }

    pub fn rename_thread(&self, tid: u64, name: &str) {
        if let Ok(mut threads) = self.threads.write() {
            if let Some(thread) = threads.iter_mut().find(|t| t.tid == tid) {
                thread.name = name.to_string();
            }
        }
    }

    pub fn set_fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, SeqCst);
    }

    pub fn fake_memory(&self) -> &FakeMemory {
        &self.memory
    }

    pub fn suspend_count(&self) -> usize {
        self.suspends.load(SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(SeqCst)
    }

    pub fn is_suspended(&self, tid: u64) -> bool {
        self.suspended.load(SeqCst) == tid
    }

    /// Writes a `[saved_fp, return_addr]` record at `fp`.
    pub fn write_frame(&self, fp: usize, saved_fp: usize, return_addr: usize) {
        self.memory.write(fp, saved_fp);
        self.memory.write(fp + WORD, return_addr);
    }

    /// Lays out a frame-pointer chain in `stack`, innermost record first, `stride` bytes apart,
    /// starting at `first_fp`. The outermost record has a null saved FP, ending the walk.
    pub fn write_chain(&self, first_fp: usize, stride: usize, return_addrs: &[usize]) {
        let mut fp = first_fp;
        for (i, ret) in return_addrs.iter().enumerate() {
            let next = if i + 1 == return_addrs.len() {
                0
            } else {
                fp + stride
            };
            self.write_frame(fp, next, *ret);
            fp += stride;
        }
    }

    fn with_thread<T>(&self, tid: u64, f: impl FnOnce(&FakeThread) -> T) -> Option<T> {
        let threads = self.threads.read().ok()?;
        threads.iter().find(|t| t.tid == tid).map(f)
    }
}

impl ThreadControl for FakeThreadControl {
    fn current_thread(&self) -> ThreadHandle {
        ThreadHandle::new(ThreadRef(self.current), self.current)
    }

    fn threads(&self) -> Result<Vec<ThreadHandle>, ThreadControlError> {
        if self.fail_enumeration.load(SeqCst) {
            return Err(ThreadControlError::Parse {
                path: "fake".to_string(),
            });
        }
        let threads = self.threads.read().map_err(|_| ThreadControlError::Busy)?;
        Ok(threads.iter().map(FakeThread::handle).collect())
    }

    fn thread_name(&self, thread: &ThreadHandle) -> Result<String, ThreadControlError> {
        self.with_thread(thread.tid(), |t| t.name.clone())
            .ok_or(ThreadControlError::Gone(thread.tid()))
    }

    fn thread_priority(&self, thread: &ThreadHandle) -> i32 {
        self.with_thread(thread.tid(), |t| t.priority).unwrap_or(-1)
    }

    fn is_idle(&self, thread: &ThreadHandle) -> bool {
        self.with_thread(thread.tid(), |t| t.idle).unwrap_or(false)
    }

    fn stack_regions(&self, thread: &ThreadHandle) -> Result<StackRegions, ThreadControlError> {
        self.with_thread(thread.tid(), |t| StackRegions::single(t.stack))
            .ok_or(ThreadControlError::Gone(thread.tid()))
    }

    fn current_stack_bounds(&self) -> StackBounds {
        self.with_thread(self.current, |t| t.stack)
            .unwrap_or(StackBounds::INVALID)
    }

    fn suspend(&self, thread: &ThreadHandle) -> Result<(), ThreadControlError> {
        let tid = thread.tid();
        if tid == self.current {
            return Err(ThreadControlError::SelfSuspend);
        }
        if self.with_thread(tid, |t| t.fail_suspend).unwrap_or(true) {
            return Err(ThreadControlError::SuspendTimeout(tid));
        }
        self.suspended
            .compare_exchange(0, tid, SeqCst, SeqCst)
            .map_err(|_| ThreadControlError::Busy)?;
        self.suspends.fetch_add(1, SeqCst);
        Ok(())
    }

    fn resume(&self, thread: &ThreadHandle) -> Result<(), ThreadControlError> {
        let tid = thread.tid();
        self.suspended
            .compare_exchange(tid, 0, SeqCst, SeqCst)
            .map_err(|_| ThreadControlError::NotSuspended(tid))?;
        self.resumes.fetch_add(1, SeqCst);
        Ok(())
    }

    fn register_state(&self, thread: &ThreadHandle) -> Result<RegisterState, ThreadControlError> {
        let tid = thread.tid();
        if tid != self.current && !self.is_suspended(tid) {
            return Err(ThreadControlError::RegistersUnavailable(tid));
        }
        self.with_thread(tid, |t| t.registers)
            .ok_or(ThreadControlError::RegistersUnavailable(tid))
    }

    fn memory(&self) -> &dyn MemoryReader {
        &self.memory
    }
}
