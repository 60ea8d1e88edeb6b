// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether the frame walker should follow async extended frame records.
///
/// On arm64 Apple targets a function that needs an async context stores three words in its
/// prologue, `[AsyncContext, FP | (1 << 60), LR]`, and points the frame pointer at the tagged FP.
/// Bits 63:60 of the stored FP are an ABI tag: `0b0000` for a plain `[FP, LR]` record, `0b0001`
/// for an extended record.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncFrameAbi {
    Disabled,
    ExtendedFrameRecord,
}

impl AsyncFrameAbi {
    /// The ABI used by the platform this crate was compiled for.
    pub const fn native() -> Self {
        if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            Self::ExtendedFrameRecord
        } else {
            Self::Disabled
        }
    }
}

impl Default for AsyncFrameAbi {
    fn default() -> Self {
        Self::native()
    }
}

/// How saved frame pointers and return addresses are decoded while walking a stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameAbi {
    pub async_frames: AsyncFrameAbi,
    /// Applied to every pointer read from a frame record. Strips pointer-authentication and tag
    /// bits on platforms that sign return addresses.
    pub pointer_mask: usize,
}

impl FrameAbi {
    pub const fn native() -> Self {
        let pointer_mask = if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            // arm64 Apple user space addresses fit in 47 bits; the rest holds the PAC signature.
            usize::MAX >> 17
        } else {
            usize::MAX
        };
        Self {
            async_frames: AsyncFrameAbi::native(),
            pointer_mask,
        }
    }

    pub const fn plain() -> Self {
        Self {
            async_frames: AsyncFrameAbi::Disabled,
            pointer_mask: usize::MAX,
        }
    }

    #[inline]
    pub const fn strip(&self, ptr: usize) -> usize {
        ptr & self.pointer_mask
    }
}

impl Default for FrameAbi {
    fn default() -> Self {
        Self::native()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerConfiguration {
    interval: Duration,
    // A tick that is late by less than this is run immediately instead of being dropped.
    leeway: Duration,
    max_depth: usize,
    reserved_thread_prefix: String,
    frame_abi: FrameAbi,
}

impl SamplerConfiguration {
    pub fn new(
        interval: Duration,
        leeway: Duration,
        max_depth: usize,
        reserved_thread_prefix: Option<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!interval.is_zero(), "Sampling interval must be non-zero");
        anyhow::ensure!(
            leeway < interval,
            "Sampling leeway ({leeway:?}) must be smaller than the interval ({interval:?})"
        );
        anyhow::ensure!(
            max_depth > 0 && max_depth <= constants::MAX_BACKTRACE_FRAMES,
            "max_depth must be in 1..={}, got {max_depth}",
            constants::MAX_BACKTRACE_FRAMES
        );
        let reserved_thread_prefix = reserved_thread_prefix
            .unwrap_or_else(|| constants::DEFAULT_RESERVED_THREAD_PREFIX.to_string());
        anyhow::ensure!(
            constants::SAMPLER_THREAD_NAME.starts_with(&reserved_thread_prefix),
            "Reserved prefix {reserved_thread_prefix:?} would not exclude the sampler thread"
        );

        Ok(Self {
            interval,
            leeway,
            max_depth,
            reserved_thread_prefix,
            frame_abi: FrameAbi::native(),
        })
    }

    pub fn with_frame_abi(mut self, frame_abi: FrameAbi) -> Self {
        self.frame_abi = frame_abi;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn reserved_thread_prefix(&self) -> &str {
        &self.reserved_thread_prefix
    }

    pub fn frame_abi(&self) -> FrameAbi {
        self.frame_abi
    }
}

impl Default for SamplerConfiguration {
    fn default() -> Self {
        Self {
            interval: constants::DEFAULT_SAMPLING_INTERVAL,
            leeway: constants::DEFAULT_SAMPLING_LEEWAY,
            max_depth: constants::MAX_BACKTRACE_FRAMES,
            reserved_thread_prefix: constants::DEFAULT_RESERVED_THREAD_PREFIX.to_string(),
            frame_abi: FrameAbi::native(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadNameCacheConfiguration {
    poll_interval: Duration,
    quick_poll_count: u32,
    quick_poll_interval: Duration,
}

impl ThreadNameCacheConfiguration {
    pub fn new(poll_interval: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !poll_interval.is_zero(),
            "Thread name cache poll interval must be non-zero"
        );
        Ok(Self {
            poll_interval,
            quick_poll_count: constants::NAME_CACHE_QUICK_POLL_COUNT,
            quick_poll_interval: constants::NAME_CACHE_QUICK_POLL_INTERVAL,
        })
    }

    /// Overrides the start-up refresh burst. A count of zero disables it.
    pub fn with_quick_poll(mut self, count: u32, interval: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(
            count == 0 || !interval.is_zero(),
            "Quick poll interval must be non-zero when quick polling is enabled"
        );
        self.quick_poll_count = count;
        self.quick_poll_interval = interval;
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn quick_poll_count(&self) -> u32 {
        self.quick_poll_count
    }

    pub fn quick_poll_interval(&self) -> Duration {
        self.quick_poll_interval
    }

    /// Interval to wait before the refresh numbered `refresh` (starting at 0).
    pub fn interval_before(&self, refresh: u32) -> Duration {
        if refresh < self.quick_poll_count {
            self.quick_poll_interval
        } else {
            self.poll_interval
        }
    }
}

impl Default for ThreadNameCacheConfiguration {
    fn default() -> Self {
        Self {
            poll_interval: constants::NAME_CACHE_DEFAULT_POLL_INTERVAL,
            quick_poll_count: constants::NAME_CACHE_QUICK_POLL_COUNT,
            quick_poll_interval: constants::NAME_CACHE_QUICK_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncChainConfiguration {
    node_capacity: usize,
    frame_abi: FrameAbi,
}

impl AsyncChainConfiguration {
    pub fn new(node_capacity: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(node_capacity > 0, "Async node capacity must be non-zero");
        // `u32::MAX` is the "no node" handle.
        anyhow::ensure!(
            node_capacity < u32::MAX as usize,
            "Async node capacity {node_capacity} does not fit a node handle"
        );
        Ok(Self {
            node_capacity,
            frame_abi: FrameAbi::native(),
        })
    }

    pub fn with_frame_abi(mut self, frame_abi: FrameAbi) -> Self {
        self.frame_abi = frame_abi;
        self
    }

    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    pub fn frame_abi(&self) -> FrameAbi {
        self.frame_abi
    }
}

impl Default for AsyncChainConfiguration {
    fn default() -> Self {
        Self {
            node_capacity: constants::DEFAULT_ASYNC_NODE_CAPACITY,
            frame_abi: FrameAbi::native(),
        }
    }
}
