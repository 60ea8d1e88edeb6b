// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed pool of refcounted backtrace nodes.
//!
//! Nodes are addressed by index. Free nodes form a lock-free stack whose head carries a tag that
//! changes on every update, so a pop racing with a pop/push pair of the same index fails its
//! compare-exchange. Node memory is never returned to the allocator, which lets readers copy
//! frames of a node that is concurrently released: they may see stale data, never freed memory.

use crate::shared::constants::MAX_BACKTRACE_FRAMES;
use portable_atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicU32, AtomicUsize};

const NONE: u32 = u32::MAX;

/// Index of a node in a [`NodeArena`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        (raw != NONE).then_some(Self(raw))
    }

    pub(crate) fn into_raw(handle: Option<Self>) -> u32 {
        handle.map_or(NONE, |h| h.0)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Node {
    refcount: AtomicU32,
    caller: AtomicU32,
    len: AtomicUsize,
    next_free: AtomicU32,
}

#[derive(Debug)]
pub struct NodeArena {
    nodes: Box<[Node]>,
    // `MAX_BACKTRACE_FRAMES` words per node.
    frames: Box<[AtomicUsize]>,
    free_head: AtomicU64,
    outstanding: AtomicUsize,
}

fn pack(tag: u64, index: u32) -> u64 {
    (tag << 32) | u64::from(index)
}

fn unpack(head: u64) -> (u64, u32) {
    (head >> 32, head as u32)
}

impl NodeArena {
    /// `capacity` must be below `u32::MAX`; the configuration enforces it.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(NONE as usize - 1);
        let nodes: Box<[Node]> = (0..capacity)
            .map(|i| Node {
                refcount: AtomicU32::new(0),
                caller: AtomicU32::new(NONE),
                len: AtomicUsize::new(0),
                next_free: AtomicU32::new(if i + 1 < capacity { i as u32 + 1 } else { NONE }),
            })
            .collect();
        let frames = (0..capacity * MAX_BACKTRACE_FRAMES)
            .map(|_| AtomicUsize::new(0))
            .collect();
        let first = if capacity == 0 { NONE } else { 0 };
        Self {
            nodes,
            frames,
            free_head: AtomicU64::new(pack(0, first)),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(SeqCst)
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free_head.load(Acquire);
        loop {
            let (tag, index) = unpack(head);
            if index == NONE {
                return None;
            }
            let next = self.nodes[index as usize].next_free.load(Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                SeqCst,
                Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => head = current,
            }
        }
    }

    fn push_free(&self, index: u32) {
        let mut head = self.free_head.load(Acquire);
        loop {
            let (tag, next) = unpack(head);
            self.nodes[index as usize].next_free.store(next, Relaxed);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index),
                SeqCst,
                Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Takes a free node with refcount 1. The new node takes a reference on `caller`. Returns
    /// `None` when the arena is exhausted.
    pub fn allocate(&self, frames: &[usize], caller: Option<NodeHandle>) -> Option<NodeHandle> {
        let index = self.pop_free()?;
        let node = &self.nodes[index as usize];
        let len = frames.len().min(MAX_BACKTRACE_FRAMES);
        let base = index as usize * MAX_BACKTRACE_FRAMES;
        for (slot, frame) in self.frames[base..base + len].iter().zip(frames) {
            slot.store(*frame, Relaxed);
        }
        node.len.store(len, Relaxed);
        if let Some(caller) = caller {
            self.incref(caller);
        }
        node.caller.store(NodeHandle::into_raw(caller), Relaxed);
        node.refcount.store(1, Release);
        self.outstanding.fetch_add(1, SeqCst);
        Some(NodeHandle(index))
    }

    pub fn incref(&self, handle: NodeHandle) {
        self.nodes[handle.index()].refcount.fetch_add(1, SeqCst);
    }

    /// Drops one reference. A node reaching zero goes back to the free list and releases its
    /// caller in turn, iteratively, so a long chain never deepens the stack.
    pub fn decref(&self, handle: NodeHandle) {
        let mut next = Some(handle);
        while let Some(handle) = next {
            let node = &self.nodes[handle.index()];
            if node.refcount.fetch_sub(1, SeqCst) != 1 {
                return;
            }
            next = NodeHandle::from_raw(node.caller.swap(NONE, SeqCst));
            node.len.store(0, Relaxed);
            self.push_free(handle.0);
            self.outstanding.fetch_sub(1, SeqCst);
        }
    }

    pub fn refcount(&self, handle: NodeHandle) -> u32 {
        self.nodes[handle.index()].refcount.load(SeqCst)
    }

    pub fn caller(&self, handle: NodeHandle) -> Option<NodeHandle> {
        NodeHandle::from_raw(self.nodes[handle.index()].caller.load(Acquire))
    }

    /// Copies the frames of one node into `out` and returns how many were written.
    pub fn copy_frames(&self, handle: NodeHandle, out: &mut [usize]) -> usize {
        let len = self.nodes[handle.index()]
            .len
            .load(Acquire)
            .min(MAX_BACKTRACE_FRAMES)
            .min(out.len());
        let base = handle.index() * MAX_BACKTRACE_FRAMES;
        for (dst, src) in out.iter_mut().zip(&self.frames[base..base + len]) {
            *dst = src.load(Relaxed);
        }
        len
    }
}
