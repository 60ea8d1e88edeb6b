// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::MAX_THREAD_NAME_LEN;
use crate::thread::{ThreadControl, ThreadHandle, ThreadRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    /// 0 means the thread must not be sampled.
    pub thread_id: u64,
    pub name: Option<String>,
    pub priority: i32,
}

/// Per-session cache of thread metadata, keyed by native thread reference.
///
/// Entries are never evicted: a session is short and thread churn is expected to be low. Only the
/// sampling thread uses it, hence `&mut self` everywhere.
#[derive(Debug, Default)]
pub struct ThreadMetadataCache {
    entries: Vec<(ThreadRef, ThreadMetadata)>,
    reserved_prefix: String,
}

/// Truncates to at most `max_chars` characters, on a character boundary.
pub fn truncate_name(mut name: String, max_chars: usize) -> String {
    if let Some((idx, _)) = name.char_indices().nth(max_chars) {
        name.truncate(idx);
    }
    name
}

impl ThreadMetadataCache {
    pub fn new(reserved_prefix: &str) -> Self {
        Self {
            entries: Vec::new(),
            reserved_prefix: reserved_prefix.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_reserved(&self, name: &str) -> bool {
        !self.reserved_prefix.is_empty() && name.starts_with(&self.reserved_prefix)
    }

    pub fn metadata_for_thread<C: ThreadControl + ?Sized>(
        &mut self,
        control: &C,
        thread: &ThreadHandle,
    ) -> ThreadMetadata {
        let native = thread.native();
        if let Some((_, metadata)) = self.entries.iter().find(|(r, _)| *r == native) {
            return metadata.clone();
        }

        let priority = control.thread_priority(thread);
        let metadata = if priority == -1 {
            tracing::debug!(tid = thread.tid(), "Unable to read thread priority");
            ThreadMetadata {
                thread_id: thread.tid(),
                name: None,
                priority,
            }
        } else {
            match control.thread_name(thread) {
                Ok(name) if self.is_reserved(&name) => ThreadMetadata {
                    thread_id: 0,
                    name: None,
                    priority: 0,
                },
                Ok(name) => ThreadMetadata {
                    thread_id: thread.tid(),
                    name: (!name.is_empty()).then(|| truncate_name(name, MAX_THREAD_NAME_LEN)),
                    priority,
                },
                Err(error) => {
                    tracing::debug!(tid = thread.tid(), %error, "Unable to read thread name");
                    ThreadMetadata {
                        thread_id: thread.tid(),
                        name: None,
                        priority,
                    }
                }
            }
        };
        self.entries.push((native, metadata.clone()));
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::fake::{FakeThread, FakeThreadControl};

    #[test]
    fn test_caches_first_lookup() {
        let control = FakeThreadControl::new(1);
        let thread = control.add_thread(FakeThread::new(2, "worker"));
        let mut cache = ThreadMetadataCache::new("dd.");
        let first = cache.metadata_for_thread(&control, &thread);
        assert_eq!(
            first,
            ThreadMetadata {
                thread_id: 2,
                name: Some("worker".to_string()),
                priority: 31
            }
        );
        control.rename_thread(2, "renamed");
        assert_eq!(cache.metadata_for_thread(&control, &thread), first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reserved_prefix_is_excluded() {
        let control = FakeThreadControl::new(1);
        let thread = control.add_thread(FakeThread::new(2, "dd.sampler"));
        let mut cache = ThreadMetadataCache::new("dd.");
        assert_eq!(
            cache.metadata_for_thread(&control, &thread),
            ThreadMetadata {
                thread_id: 0,
                name: None,
                priority: 0
            }
        );
    }

    #[test]
    fn test_priority_failure() {
        let control = FakeThreadControl::new(1);
        let mut thread = FakeThread::new(2, "dd.would-be-excluded");
        thread.priority = -1;
        let thread = control.add_thread(thread);
        let mut cache = ThreadMetadataCache::new("dd.");
        assert_eq!(
            cache.metadata_for_thread(&control, &thread),
            ThreadMetadata {
                thread_id: 2,
                name: None,
                priority: -1
            }
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let control = FakeThreadControl::new(1);
        let long = "é".repeat(150);
        let thread = control.add_thread(FakeThread::new(2, &long));
        let mut cache = ThreadMetadataCache::new("dd.");
        let name = cache.metadata_for_thread(&control, &thread).name.unwrap();
        assert_eq!(name.chars().count(), MAX_THREAD_NAME_LEN);
        assert_eq!(truncate_name("short".to_string(), 100), "short");
    }

    #[test]
    fn test_unnamed_thread() {
        let control = FakeThreadControl::new(1);
        let thread = control.add_thread(FakeThread::new(2, ""));
        let mut cache = ThreadMetadataCache::new("dd.");
        let metadata = cache.metadata_for_thread(&control, &thread);
        assert_eq!(metadata.thread_id, 2);
        assert_eq!(metadata.name, None);
    }
}
