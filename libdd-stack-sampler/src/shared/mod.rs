// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This module holds constants/structures that are shared between the sampler, the crash-safe
//! caches and the async interceptor.

pub mod configuration;
pub mod constants;
pub mod log;
