// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cooperative thread suspension on Linux.
//!
//! Linux has no `thread_suspend`. Instead the target is sent a dedicated real-time signal whose
//! handler records the interrupted registers, acknowledges, and spins until it is released. While
//! parked the thread executes nothing but that loop, so its stack below the handler frame is
//! stable and can be walked from the interrupted frame pointer.
//!
//! Only one thread is suspended at a time, process wide. The protocol is a small state machine on
//! [`STATE`]:
//!
//! ```text
//! IDLE --suspend()--> REQUESTED --handler--> PARKED --resume()--> RELEASED --handler--> IDLE
//!                         \--timeout--> IDLE
//! ```

use crate::shared::log::{async_safe_log, LogLevel};
use crate::thread::{RegisterState, ThreadControlError};
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use portable_atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const IDLE: u8 = 0;
const REQUESTED: u8 = 1;
const PARKED: u8 = 2;
const RELEASED: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(IDLE);
static TARGET: AtomicU64 = AtomicU64::new(0);
// Held by the thread that issued the current suspend request.
static OWNER: AtomicBool = AtomicBool::new(false);

static REG_PC: AtomicUsize = AtomicUsize::new(0);
static REG_LR: AtomicUsize = AtomicUsize::new(0);
static REG_FP: AtomicUsize = AtomicUsize::new(0);
static REG_SP: AtomicUsize = AtomicUsize::new(0);

static INSTALLED: OnceLock<Result<c_int, nix::Error>> = OnceLock::new();

/// The real-time signal used for suspension. Offset from `SIGRTMIN` to stay clear of the ones
/// glibc and common runtimes reserve for themselves.
pub fn suspend_signal() -> c_int {
    libc::SIGRTMIN() + 3
}

pub(crate) fn gettid() -> u64 {
    // Safety: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Installs the suspend handler once per process. Later calls return the first outcome.
pub fn install_handler() -> Result<(), ThreadControlError> {
    let outcome = INSTALLED.get_or_init(|| {
        let signum = suspend_signal();
        // Safety: the action is fully initialized before use and the handler only uses
        // async-signal-safe operations.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_suspend_request as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(nix::Error::last());
            }
        }
        Ok(signum)
    });
    match outcome {
        Ok(_) => Ok(()),
        Err(e) => Err(ThreadControlError::HandlerInstall(*e)),
    }
}

extern "C" fn handle_suspend_request(_signum: c_int, _info: *mut siginfo_t, ucontext: *mut c_void) {
    let saved_errno = errno::errno();
    if TARGET.load(SeqCst) == gettid() && STATE.load(SeqCst) == REQUESTED {
        // Safety: the kernel passes a valid ucontext to SA_SIGINFO handlers.
        let regs = unsafe { extract_registers(ucontext as *const ucontext_t) };
        REG_PC.store(regs.pc, Relaxed);
        REG_LR.store(regs.lr.unwrap_or(0), Relaxed);
        REG_FP.store(regs.fp, Relaxed);
        REG_SP.store(regs.sp, Relaxed);
        // Fails if the requester gave up waiting.
        if STATE
            .compare_exchange(REQUESTED, PARKED, SeqCst, SeqCst)
            .is_ok()
        {
            let mut spins = 0u32;
            while STATE.load(Acquire) == PARKED {
                spin_or_yield(&mut spins);
            }
            STATE.store(IDLE, Release);
        }
    }
    errno::set_errno(saved_errno);
}

fn spin_or_yield(spins: &mut u32) {
    *spins = spins.wrapping_add(1);
    if *spins % 64 == 0 {
        // Safety: sched_yield has no preconditions and is async-signal-safe.
        unsafe { libc::sched_yield() };
    } else {
        std::hint::spin_loop();
    }
}

/// # Safety
/// `ucontext` must point to the context handed to a signal handler.
unsafe fn extract_registers(ucontext: *const ucontext_t) -> RegisterState {
    #[cfg(target_arch = "x86_64")]
    {
        let gregs = &(*ucontext).uc_mcontext.gregs;
        RegisterState {
            pc: gregs[libc::REG_RIP as usize] as usize,
            lr: None,
            fp: gregs[libc::REG_RBP as usize] as usize,
            sp: gregs[libc::REG_RSP as usize] as usize,
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        let mcontext = &(*ucontext).uc_mcontext;
        RegisterState {
            pc: mcontext.pc as usize,
            lr: Some(mcontext.regs[30] as usize),
            fp: mcontext.regs[29] as usize,
            sp: mcontext.sp as usize,
        }
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = ucontext;
        RegisterState::default()
    }
}

/// Stops `tid` until [`resume`] is called. Fails with [`ThreadControlError::Busy`] while another
/// thread is suspended.
pub fn suspend(tid: u64, timeout: Duration) -> Result<(), ThreadControlError> {
    install_handler()?;
    if tid == gettid() {
        return Err(ThreadControlError::SelfSuspend);
    }
    if OWNER
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_err()
    {
        return Err(ThreadControlError::Busy);
    }

    TARGET.store(tid, SeqCst);
    STATE.store(REQUESTED, SeqCst);

    // Safety: tgkill has no memory preconditions; a stale tid yields ESRCH.
    let rval = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid(),
            tid as libc::pid_t,
            suspend_signal(),
        )
    };
    if rval != 0 {
        let errno = nix::Error::last();
        reset();
        return Err(match errno {
            nix::errno::Errno::ESRCH => ThreadControlError::Gone(tid),
            source => ThreadControlError::Signal { tid, source },
        });
    }

    let deadline = Instant::now() + timeout;
    let mut spins = 0u32;
    loop {
        if STATE.load(Acquire) == PARKED {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        spin_or_yield(&mut spins);
    }
    // The handler may still park between the last check and this exchange.
    match STATE.compare_exchange(REQUESTED, IDLE, SeqCst, SeqCst) {
        Ok(_) => {
            TARGET.store(0, SeqCst);
            OWNER.store(false, SeqCst);
            async_safe_log!(LogLevel::Debug, "thread {} did not park in time", tid);
            Err(ThreadControlError::SuspendTimeout(tid))
        }
        Err(_) => Ok(()),
    }
}

/// Releases a thread stopped by [`suspend`] and waits until it has left the handler.
pub fn resume(tid: u64) -> Result<(), ThreadControlError> {
    if TARGET.load(SeqCst) != tid
        || STATE
            .compare_exchange(PARKED, RELEASED, SeqCst, SeqCst)
            .is_err()
    {
        return Err(ThreadControlError::NotSuspended(tid));
    }
    let mut spins = 0u32;
    while STATE.load(Acquire) == RELEASED {
        spin_or_yield(&mut spins);
    }
    reset();
    Ok(())
}

fn reset() {
    STATE.store(IDLE, SeqCst);
    TARGET.store(0, SeqCst);
    OWNER.store(false, SeqCst);
}

/// Registers recorded when `tid` parked.
pub fn registers_of(tid: u64) -> Result<RegisterState, ThreadControlError> {
    if TARGET.load(SeqCst) != tid || STATE.load(Acquire) != PARKED {
        return Err(ThreadControlError::RegistersUnavailable(tid));
    }
    let lr = REG_LR.load(Relaxed);
    Ok(RegisterState {
        pc: REG_PC.load(Relaxed),
        lr: if cfg!(target_arch = "aarch64") {
            Some(lr)
        } else {
            None
        },
        fp: REG_FP.load(Relaxed),
        sp: REG_SP.load(Relaxed),
    })
}
