// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Crash-safe stack sampling.
//!
//! * [`collector`] walks frame pointers of suspended threads and drives periodic sampling.
//! * [`crash`] holds what a crash handler may read: frozen thread names, async call chains and a
//!   preallocated batch buffer.
//! * [`thread`] abstracts OS thread control behind [`thread::ThreadControl`].

pub mod collector;
pub mod crash;
pub mod shared;
pub mod thread;

pub use collector::{
    backtrace, capture_current_thread, enumerate_backtraces_for_all_threads, Backtrace,
    BacktraceSink, PassSummary, SamplerState, SamplingProfiler, ThreadMetadata,
    ThreadMetadataCache, Walk,
};
pub use crash::{AsyncChainInterceptor, BatchBuffer, ThreadNameCache};
pub use shared::configuration::{
    AsyncChainConfiguration, AsyncFrameAbi, FrameAbi, SamplerConfiguration,
    ThreadNameCacheConfiguration,
};
pub use shared::log::LogLevel;
pub use thread::{
    MemoryReader, StackBounds, ThreadControl, ThreadControlError, ThreadHandle, ThreadRef,
};

#[cfg(target_os = "linux")]
pub use thread::linux::LinuxThreadControl;
