// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity buffer holding a `{"items":[...]}` payload.
//!
//! All memory is reserved by [`BatchBuffer::init`]; appending never reallocates, so items can be
//! added from a crash handler. The buffer always holds a complete payload, even when empty.

use std::collections::TryReserveError;

const PREFIX: &[u8] = b"{\"items\":[";
const SUFFIX: &[u8] = b"]}";
const SEPARATOR: u8 = b',';

/// Size of the payload with no items.
pub const EMPTY_PAYLOAD_LEN: usize = PREFIX.len() + SUFFIX.len();

#[derive(Debug, thiserror::Error)]
pub enum BatchBufferError {
    #[error("Capacity {capacity} cannot hold the empty payload ({minimum} bytes)")]
    CapacityTooSmall { capacity: usize, minimum: usize },
    #[error("Unable to reserve the batch buffer: {0}")]
    AllocationFailed(#[from] TryReserveError),
}

#[derive(Debug)]
pub struct BatchBuffer {
    data: Vec<u8>,
    capacity: usize,
    items_capacity: usize,
    item_count: usize,
    destroyed: bool,
}

impl BatchBuffer {
    /// Reserves `capacity` bytes for a payload of at most `items_capacity` items.
    pub fn init(capacity: usize, items_capacity: usize) -> Result<Self, BatchBufferError> {
        if capacity < EMPTY_PAYLOAD_LEN {
            return Err(BatchBufferError::CapacityTooSmall {
                capacity,
                minimum: EMPTY_PAYLOAD_LEN,
            });
        }
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        let mut buffer = Self {
            data,
            capacity,
            items_capacity,
            item_count: 0,
            destroyed: false,
        };
        buffer.clear();
        Ok(buffer)
    }

    /// Appends one serialized item. Returns `false`, leaving the payload untouched, if it does
    /// not fit, the item limit is reached or the buffer was destroyed. An empty item is accepted
    /// and ignored.
    pub fn add_item(&mut self, item: &[u8]) -> bool {
        if self.destroyed {
            return false;
        }
        if item.is_empty() {
            return true;
        }
        if self.item_count >= self.items_capacity {
            return false;
        }
        let separator = usize::from(self.item_count > 0);
        let Some(new_size) = self
            .data
            .len()
            .checked_add(separator)
            .and_then(|size| size.checked_add(item.len()))
        else {
            return false;
        };
        if new_size > self.capacity {
            return false;
        }

        self.data.truncate(self.data.len() - SUFFIX.len());
        if separator == 1 {
            self.data.push(SEPARATOR);
        }
        self.data.extend_from_slice(item);
        self.data.extend_from_slice(SUFFIX);
        self.item_count += 1;
        true
    }

    /// The complete payload, or `None` once destroyed.
    pub fn data(&self) -> Option<&[u8]> {
        (!self.destroyed).then_some(self.data.as_slice())
    }

    pub fn data_size(&self) -> usize {
        if self.destroyed {
            0
        } else {
            self.data.len()
        }
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn items_capacity(&self) -> usize {
        self.items_capacity
    }

    /// Drops every item, keeping the reservation.
    pub fn clear(&mut self) {
        if self.destroyed {
            return;
        }
        self.data.clear();
        self.data.extend_from_slice(PREFIX);
        self.data.extend_from_slice(SUFFIX);
        self.item_count = 0;
    }

    /// Releases the memory. Later appends are rejected.
    pub fn destroy(&mut self) {
        self.data = Vec::new();
        self.capacity = 0;
        self.items_capacity = 0;
        self.item_count = 0;
        self.destroyed = true;
    }
}
