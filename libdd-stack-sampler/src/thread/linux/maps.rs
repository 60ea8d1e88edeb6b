// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack candidates from `/proc/self/maps`.
//!
//! The main thread runs on `[stack]`; other threads run on private anonymous read-write mappings
//! created by the thread library. Which one belongs to a given thread is only known once its stack
//! pointer is, so every candidate is kept and resolved later.

use crate::thread::{StackBounds, StackRegions, ThreadControlError};

const MAPS_PATH: &str = "/proc/self/maps";

pub fn read_stack_regions() -> Result<StackRegions, ThreadControlError> {
    let maps = std::fs::read_to_string(MAPS_PATH).map_err(|source| ThreadControlError::Proc {
        path: MAPS_PATH.to_string(),
        source,
    })?;
    Ok(parse_stack_regions(&maps))
}

pub fn parse_stack_regions(maps: &str) -> StackRegions {
    StackRegions::new(maps.lines().filter_map(parse_line).collect())
}

fn parse_line(line: &str) -> Option<StackBounds> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let inode = fields.next()?;
    let path = fields.next();

    let perms = perms.as_bytes();
    if perms.len() < 4 || perms[0] != b'r' || perms[1] != b'w' || perms[3] != b'p' {
        return None;
    }
    let is_stack = match path {
        None => inode == "0",
        Some(path) => path.starts_with("[stack"),
    };
    if !is_stack {
        return None;
    }

    let (low, high) = range.split_once('-')?;
    let low = usize::from_str_radix(low, 16).ok()?;
    let high = usize::from_str_radix(high, 16).ok()?;
    let bounds = StackBounds::new(low, high);
    bounds.is_valid().then_some(bounds)
}
