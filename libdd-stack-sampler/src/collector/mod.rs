// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process sampling: stack walking, per-session thread metadata and the scheduler driving them.

pub mod backtrace;
pub mod metadata_cache;
pub mod sampler;

pub use backtrace::{
    backtrace, capture_current_thread, enumerate_backtraces_for_all_threads, Backtrace,
    BacktraceSink, PassSummary, Walk,
};
pub use metadata_cache::{ThreadMetadata, ThreadMetadataCache};
pub use sampler::{SamplerCounters, SamplerError, SamplerState, SamplingProfiler};
