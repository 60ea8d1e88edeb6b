// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and defaults used across the sampler.
//!
//! Everything that runs while a thread is suspended, or inside a signal handler, sizes its buffers
//! from these constants so that no allocation is needed on those paths.

use std::time::Duration;

/// Maximum number of return addresses recorded for one backtrace, async frames included.
pub const MAX_BACKTRACE_FRAMES: usize = 128;

/// Thread names longer than this many characters are truncated before being cached.
pub const MAX_THREAD_NAME_LEN: usize = 100;

/// Number of slots in the table mapping a running thread to its async caller.
pub const ASYNC_CALLER_SLOTS: usize = 127;

/// Multiplier used to spread thread ids over [`ASYNC_CALLER_SLOTS`].
pub const ASYNC_CALLER_HASH_MULTIPLIER: u64 = 19;

/// Threads whose name starts with this prefix belong to us and are never sampled.
pub const DEFAULT_RESERVED_THREAD_PREFIX: &str = "dd.";

/// Name given to the background sampling thread. Carries the reserved prefix.
pub const SAMPLER_THREAD_NAME: &str = "dd.sampler";

/// Name given to the thread refreshing the crash-safe name cache.
pub const NAME_CACHE_THREAD_NAME: &str = "dd.threadnames";

pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_SAMPLING_LEEWAY: Duration = Duration::from_millis(1);

/// The name cache refreshes this many times at [`NAME_CACHE_QUICK_POLL_INTERVAL`] right after
/// start-up, when threads are still being spawned, before settling on the configured interval.
pub const NAME_CACHE_QUICK_POLL_COUNT: u32 = 4;
pub const NAME_CACHE_QUICK_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const NAME_CACHE_DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of async backtrace nodes preallocated by the interceptor.
pub const DEFAULT_ASYNC_NODE_CAPACITY: usize = 256;

/// How long `suspend` waits for the target thread to acknowledge before giving up.
pub const SUSPEND_TIMEOUT: Duration = Duration::from_millis(50);
