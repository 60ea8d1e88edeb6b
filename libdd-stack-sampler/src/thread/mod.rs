// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS thread access used by the sampler: enumeration, metadata, suspension, register capture and
//! probed memory reads.
//!
//! Everything platform specific sits behind [`ThreadControl`] so that the frame walker and the
//! caches can be driven by a simulated process in tests.

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod registers;

use std::fmt;

/// Native reference to an OS thread. On Linux this is the kernel thread id.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadRef(pub u64);

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread found during one enumeration pass. Does not keep the thread alive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    native: ThreadRef,
    tid: u64,
}

impl ThreadHandle {
    pub const fn new(native: ThreadRef, tid: u64) -> Self {
        Self { native, tid }
    }

    pub const fn native(&self) -> ThreadRef {
        self.native
    }

    /// Stable, process-unique, non-zero id.
    pub const fn tid(&self) -> u64 {
        self.tid
    }
}

/// Registers of a suspended (or the calling) thread that the frame walker needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RegisterState {
    pub pc: usize,
    /// Only present on architectures with a link register.
    pub lr: Option<usize>,
    pub fp: usize,
    pub sp: usize,
}

/// Half-open `[low, high)` address range of a thread stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct StackBounds {
    pub low: usize,
    pub high: usize,
}

impl StackBounds {
    pub const INVALID: Self = Self { low: 0, high: 0 };

    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    pub const fn is_valid(&self) -> bool {
        self.low != 0 && self.high != 0 && self.low < self.high
    }

    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        self.low <= addr && addr < self.high
    }

    /// True if a full frame record starting at `addr` lies within the stack and is aligned.
    #[inline]
    pub const fn is_valid_frame(&self, addr: usize) -> bool {
        self.contains(addr) && addr % std::mem::align_of::<usize>() == 0
    }
}

/// Candidate stack ranges for a thread, captured before it is suspended.
///
/// Building this may read files and allocate, which is forbidden once the target is stopped.
/// [`StackRegions::resolve`] only does a binary search, so it can run after suspension, when the
/// stack pointer is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackRegions {
    // Sorted by `low`, non-overlapping.
    regions: Vec<StackBounds>,
}

impl StackRegions {
    pub fn new(mut regions: Vec<StackBounds>) -> Self {
        regions.retain(StackBounds::is_valid);
        regions.sort_unstable_by_key(|r| r.low);
        regions.dedup_by(|b, a| b.low < a.high);
        Self { regions }
    }

    pub fn single(bounds: StackBounds) -> Self {
        Self::new(vec![bounds])
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The region containing `sp`, or [`StackBounds::INVALID`].
    pub fn resolve(&self, sp: usize) -> StackBounds {
        let idx = self.regions.partition_point(|r| r.low <= sp);
        match idx.checked_sub(1).and_then(|i| self.regions.get(i)) {
            Some(region) if region.contains(sp) => *region,
            _ => StackBounds::INVALID,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadControlError {
    #[error("Thread {0} no longer exists")]
    Gone(u64),
    #[error("Failed to read {path}: {source}")]
    Proc {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to parse {path}")]
    Parse { path: String },
    #[error("Failed to signal thread {tid}: {source}")]
    Signal {
        tid: u64,
        #[source]
        source: nix::Error,
    },
    #[error("Unable to install the suspend signal handler: {0}")]
    HandlerInstall(#[source] nix::Error),
    #[error("Thread {0} did not acknowledge the suspend request in time")]
    SuspendTimeout(u64),
    #[error("Another thread is already suspended")]
    Busy,
    #[error("Cannot suspend the calling thread")]
    SelfSuspend,
    #[error("Thread {0} is not suspended")]
    NotSuspended(u64),
    #[error("Registers of thread {0} are unavailable")]
    RegistersUnavailable(u64),
}

/// Probed memory access. Reading through this never faults, even if the address is unmapped.
pub trait MemoryReader {
    fn read_word(&self, addr: usize) -> Option<usize>;
}

/// Everything the sampler needs from the OS about threads.
///
/// Between [`ThreadControl::suspend`] and [`ThreadControl::resume`] callers only use
/// [`ThreadControl::register_state`] and [`ThreadControl::memory`]. Implementations must keep
/// those two free of allocation and locks: the suspended thread may hold the allocator lock.
pub trait ThreadControl: Send + Sync {
    fn current_thread(&self) -> ThreadHandle;

    /// Every live thread of the process, the calling one included.
    fn threads(&self) -> Result<Vec<ThreadHandle>, ThreadControlError>;

    /// The thread name, not truncated.
    fn thread_name(&self, thread: &ThreadHandle) -> Result<String, ThreadControlError>;

    /// Scheduling priority, or -1 if it cannot be determined.
    fn thread_priority(&self, thread: &ThreadHandle) -> i32;

    /// True if the thread is parked waiting for work. Such threads are not walked.
    fn is_idle(&self, thread: &ThreadHandle) -> bool;

    /// Stack ranges the thread may be running on. Called before suspension.
    fn stack_regions(&self, thread: &ThreadHandle) -> Result<StackRegions, ThreadControlError>;

    /// Stack bounds of the calling thread.
    fn current_stack_bounds(&self) -> StackBounds;

    fn suspend(&self, thread: &ThreadHandle) -> Result<(), ThreadControlError>;

    fn resume(&self, thread: &ThreadHandle) -> Result<(), ThreadControlError>;

    /// Registers of a suspended thread, or of the calling thread at the time of the call.
    fn register_state(&self, thread: &ThreadHandle) -> Result<RegisterState, ThreadControlError>;

    fn memory(&self) -> &dyn MemoryReader;
}
