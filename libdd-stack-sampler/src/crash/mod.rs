// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! State that a crash handler reads: thread names, async call chains, and a preallocated buffer
//! for serialized items. Nothing here allocates or locks once set up.

pub mod async_chain;
pub mod batch_buffer;
pub mod thread_name_cache;

pub use async_chain::{AsyncChainInterceptor, EntryPoint, HookTable, InterposeError, NodeHandle};
pub use batch_buffer::{BatchBuffer, BatchBufferError};
pub use thread_name_cache::{RefreshOutcome, ThreadNameCache, ThreadNameCacheError};
