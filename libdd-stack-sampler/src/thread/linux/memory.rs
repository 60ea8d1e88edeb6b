// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-free reads of our own address space.
//!
//! `process_vm_readv` on our own pid copies memory through the kernel and reports `EFAULT` instead
//! of raising `SIGSEGV`. Where it is unavailable (seccomp, old kernels) we fall back to writing the
//! word into a pipe, which fails the same way, and reading it back.

use crate::thread::MemoryReader;
use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

const WORD: usize = std::mem::size_of::<usize>();

pub struct ProcessMemory {
    pid: Pid,
    vm_readv_unavailable: AtomicBool,
    // (read end, write end), non-blocking.
    probe: Option<(OwnedFd, OwnedFd)>,
    probe_busy: AtomicBool,
}

impl ProcessMemory {
    pub fn new() -> Self {
        let probe = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC | nix::fcntl::OFlag::O_NONBLOCK)
            .map_err(|e| tracing::warn!(error = %e, "Unable to create the memory probe pipe"))
            .ok();
        Self {
            pid: nix::unistd::getpid(),
            vm_readv_unavailable: AtomicBool::new(false),
            probe,
            probe_busy: AtomicBool::new(false),
        }
    }

    fn read_with_vm_readv(&self, addr: usize) -> Result<usize, Errno> {
        let mut buffer = [0u8; WORD];
        let mut local_iov = [IoSliceMut::new(&mut buffer)];
        let remote_iov = [RemoteIoVec {
            base: addr,
            len: WORD,
        }];
        match process_vm_readv(self.pid, &mut local_iov, &remote_iov)? {
            WORD => Ok(usize::from_ne_bytes(buffer)),
            _ => Err(Errno::EFAULT),
        }
    }

    /// Pipe based probe. Returns `None` if another thread is using the pipe: waiting could
    /// deadlock against a suspended holder.
    fn read_with_pipe(&self, addr: usize) -> Option<usize> {
        let (read_end, write_end) = self.probe.as_ref()?;
        if self.probe_busy.swap(true, Acquire) {
            return None;
        }
        // Safety: write(2) validates the source range and returns EFAULT for unmapped memory.
        let written = unsafe {
            libc::write(
                write_end.as_raw_fd(),
                addr as *const libc::c_void,
                WORD,
            )
        };
        let result = if written == WORD as isize {
            let mut buffer = [0u8; WORD];
            // Safety: the destination is a local buffer of WORD bytes.
            let read = unsafe {
                libc::read(
                    read_end.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    WORD,
                )
            };
            (read == WORD as isize).then(|| usize::from_ne_bytes(buffer))
        } else {
            None
        };
        self.probe_busy.store(false, Release);
        result
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReader for ProcessMemory {
    fn read_word(&self, addr: usize) -> Option<usize> {
        if addr == 0 || addr % WORD != 0 {
            return None;
        }
        if !self.vm_readv_unavailable.load(Relaxed) {
            match self.read_with_vm_readv(addr) {
                Ok(word) => return Some(word),
                Err(Errno::ENOSYS) | Err(Errno::EPERM) => {
                    self.vm_readv_unavailable.store(true, Relaxed);
                }
                Err(_) => return None,
            }
        }
        self.read_with_pipe(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_mapped_memory() {
        let value: usize = 0x1234_5678;
        let memory = ProcessMemory::new();
        assert_eq!(memory.read_word(&value as *const usize as usize), Some(0x1234_5678));
    }

    #[test]
    fn test_unmapped_and_misaligned() {
        let memory = ProcessMemory::new();
        assert_eq!(memory.read_word(0), None);
        assert_eq!(memory.read_word(WORD), None);
        let value: [usize; 2] = [1, 2];
        assert_eq!(memory.read_word(value.as_ptr() as usize + 1), None);
    }

    #[test]
    fn test_pipe_fallback() {
        let value: usize = 42;
        let memory = ProcessMemory::new();
        assert_eq!(memory.read_with_pipe(&value as *const usize as usize), Some(42));
        assert_eq!(memory.read_with_pipe(WORD), None);
        // The pipe is left empty after a failed probe.
        assert_eq!(memory.read_with_pipe(&value as *const usize as usize), Some(42));
    }
}
