// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`ThreadControl`] for Linux, built on `/proc/self` and a suspend signal.

pub mod maps;
pub mod memory;
pub mod suspend;

use crate::shared::constants;
use crate::thread::registers::current_register_state;
use crate::thread::{
    MemoryReader, RegisterState, StackBounds, StackRegions, ThreadControl, ThreadControlError,
    ThreadHandle, ThreadRef,
};
use memory::ProcessMemory;
use std::cell::Cell;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const TASK_DIR: &str = "/proc/self/task";

// Every thread of one sampling pass shares a single read of the maps file.
const MAPS_SNAPSHOT_TTL: Duration = Duration::from_millis(5);

/// Scheduler state and priority from `/proc/self/task/<tid>/stat`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskStat {
    pub state: char,
    pub priority: i32,
}

impl TaskStat {
    pub fn parse(stat: &str) -> Option<Self> {
        // The command name may contain spaces and parentheses; fields resume after the last ')'.
        let rest = &stat[stat.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        let state = fields.next()?.chars().next()?;
        // `priority` is field 18 of stat, the 15th after the state.
        let priority = fields.nth(14)?.parse().ok()?;
        Some(Self { state, priority })
    }

    /// Interruptible sleep: the thread is blocked waiting for something.
    pub fn is_idle(&self) -> bool {
        self.state == 'S'
    }
}

pub struct LinuxThreadControl {
    memory: ProcessMemory,
    suspend_timeout: Duration,
    maps_snapshot: Mutex<Option<(Instant, StackRegions)>>,
}

impl LinuxThreadControl {
    pub fn new() -> Result<Self, ThreadControlError> {
        suspend::install_handler()?;
        Ok(Self {
            memory: ProcessMemory::new(),
            suspend_timeout: constants::SUSPEND_TIMEOUT,
            maps_snapshot: Mutex::new(None),
        })
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    fn task_path(thread: &ThreadHandle, file: &str) -> String {
        format!("{TASK_DIR}/{}/{file}", thread.tid())
    }

    fn read_task_file(thread: &ThreadHandle, file: &str) -> Result<String, ThreadControlError> {
        let path = Self::task_path(thread, file);
        std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ThreadControlError::Gone(thread.tid())
            } else {
                ThreadControlError::Proc { path, source }
            }
        })
    }

    pub fn task_stat(&self, thread: &ThreadHandle) -> Result<TaskStat, ThreadControlError> {
        let stat = Self::read_task_file(thread, "stat")?;
        TaskStat::parse(&stat).ok_or_else(|| ThreadControlError::Parse {
            path: Self::task_path(thread, "stat"),
        })
    }
}

fn query_current_stack_bounds() -> StackBounds {
    // Safety: `attr` is initialized by pthread_getattr_np before use and destroyed after.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return StackBounds::INVALID;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return StackBounds::INVALID;
        }
        let low = addr as usize;
        StackBounds::new(low, low.saturating_add(size))
    }
}

thread_local! {
    static CURRENT_STACK_BOUNDS: Cell<Option<StackBounds>> = const { Cell::new(None) };
}

impl ThreadControl for LinuxThreadControl {
    fn current_thread(&self) -> ThreadHandle {
        let tid = suspend::gettid();
        ThreadHandle::new(ThreadRef(tid), tid)
    }

    fn threads(&self) -> Result<Vec<ThreadHandle>, ThreadControlError> {
        let entries = std::fs::read_dir(TASK_DIR).map_err(|source| ThreadControlError::Proc {
            path: TASK_DIR.to_string(),
            source,
        })?;
        let mut threads: Vec<ThreadHandle> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u64>().ok())
            .map(|tid| ThreadHandle::new(ThreadRef(tid), tid))
            .collect();
        threads.sort_unstable_by_key(ThreadHandle::tid);
        Ok(threads)
    }

    fn thread_name(&self, thread: &ThreadHandle) -> Result<String, ThreadControlError> {
        let mut name = Self::read_task_file(thread, "comm")?;
        if name.ends_with('\n') {
            name.pop();
        }
        Ok(name)
    }

    fn thread_priority(&self, thread: &ThreadHandle) -> i32 {
        self.task_stat(thread).map_or(-1, |stat| stat.priority)
    }

    fn is_idle(&self, thread: &ThreadHandle) -> bool {
        self.task_stat(thread).is_ok_and(|stat| stat.is_idle())
    }

    fn stack_regions(&self, _thread: &ThreadHandle) -> Result<StackRegions, ThreadControlError> {
        let mut snapshot = match self.maps_snapshot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((taken, regions)) = snapshot.as_ref() {
            if taken.elapsed() < MAPS_SNAPSHOT_TTL {
                return Ok(regions.clone());
            }
        }
        let regions = maps::read_stack_regions()?;
        *snapshot = Some((Instant::now(), regions.clone()));
        Ok(regions)
    }

    fn current_stack_bounds(&self) -> StackBounds {
        CURRENT_STACK_BOUNDS.with(|cached| match cached.get() {
            Some(bounds) => bounds,
            None => {
                let bounds = query_current_stack_bounds();
                cached.set(Some(bounds));
                bounds
            }
        })
    }

    fn suspend(&self, thread: &ThreadHandle) -> Result<(), ThreadControlError> {
        suspend::suspend(thread.tid(), self.suspend_timeout)
    }

    fn resume(&self, thread: &ThreadHandle) -> Result<(), ThreadControlError> {
        suspend::resume(thread.tid())
    }

    fn register_state(&self, thread: &ThreadHandle) -> Result<RegisterState, ThreadControlError> {
        if thread.tid() == suspend::gettid() {
            Ok(current_register_state())
        } else {
            suspend::registers_of(thread.tid())
        }
    }

    fn memory(&self) -> &dyn MemoryReader {
        &self.memory
    }
}
