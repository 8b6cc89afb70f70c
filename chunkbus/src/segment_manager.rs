// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Owns every [`Segment`] a process hosts and resolves which one a caller
//! may read or write, based on POSIX group membership. This is the entry
//! point an embedding application (a broker, or a test harness standing
//! in for one) constructs once at startup from a [`SegmentConfig`].

use crate::error::{FatalErrorSink, LoggingFatalErrorSink, SegmentConfigError, SegmentLookupError};
use crate::mem_pool_collection::{PoolConfig, PoolSet};
use crate::segment::Segment;
use chunkbus_cal::shm_allocator::SegmentId;
use chunkbus_pal::posix_group::PosixGroup;
use chunkbus_pal::posix_user::PosixUser;

/// Upper bound on segments a single [`SegmentManager`] can host, driven by
/// [`SegmentId`] reserving id `0` for the null relative pointer and capping at
/// [`SegmentId::max_segment_id()`]; capped further here to keep a linear
/// scan over `segments` cheap regardless of how many ids remain available.
pub const MAX_SEGMENTS: usize = 100;

/// Opaque, user-suppliable tag carried verbatim alongside a segment's mapping info. Not
/// interpreted by this crate; an embedding application can use it to record e.g. the NUMA node or
/// backing device a segment's memory was placed on.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MemoryInfo {
    pub device_id: u16,
}

/// One segment's static configuration, as supplied to [`SegmentManager::new()`].
#[derive(Debug, Clone, Default)]
pub struct SegmentEntry {
    pub name: String,
    pub reader_group: Option<String>,
    pub writer_group: Option<String>,
    pub pool_config: PoolConfig,
    pub memory_info: MemoryInfo,
}

/// The full set of segments a [`SegmentManager`] should create at startup.
#[derive(Debug, Clone, Default)]
pub struct SegmentConfig {
    pub entries: Vec<SegmentEntry>,
}

impl SegmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, entry: SegmentEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

/// A segment a caller is permitted to read, returned by [`SegmentManager::segment_mappings()`].
#[derive(Debug, Clone)]
pub struct SegmentMapping {
    pub segment_name: String,
    pub size: usize,
    pub is_writable: bool,
    pub segment_id: SegmentId,
    pub memory_info: MemoryInfo,
}

/// The writable handle returned by [`SegmentManager::writable_segment_by_name()`] and
/// [`SegmentManager::writable_segment_by_group()`] — everything a publisher/client port needs to
/// start loaning chunks.
#[derive(Debug, Clone)]
pub struct WritableSegment {
    pub pool_set: PoolSet,
    pub segment_id: SegmentId,
}

/// Owns every configured [`Segment`] and answers read/write access queries for a given
/// [`PosixUser`]. Segments that fail to construct (unknown group, shared memory creation
/// failure) or collide with an already-added name are skipped and reported through a
/// [`FatalErrorSink`] rather than aborting the whole set.
#[derive(Debug)]
pub struct SegmentManager {
    segments: Vec<Segment>,
}

impl SegmentManager {
    /// Builds every segment in `config`, reporting fatal misconfiguration through the default
    /// [`LoggingFatalErrorSink`].
    pub fn new(config: &SegmentConfig) -> Self {
        Self::new_with_error_sink(config, &LoggingFatalErrorSink)
    }

    pub fn new_with_error_sink(config: &SegmentConfig, sink: &dyn FatalErrorSink) -> Self {
        let mut segments = Vec::new();
        // id 0 is reserved: it is what a null `PointerOffset` decodes to, so no real segment may
        // ever claim it.
        let mut next_id: u16 = 1;

        for entry in &config.entries {
            if segments.iter().any(|s: &Segment| s.name() == entry.name) {
                sink.report(
                    SegmentConfigError::MultipleSegmentConfigEntriesWithSameName,
                    &entry.name,
                );
                continue;
            }

            if segments.len() >= MAX_SEGMENTS || next_id as usize > SegmentId::max_segment_id() as usize
            {
                sink.report(SegmentConfigError::SegmentInsufficientSegmentIds, &entry.name);
                continue;
            }

            match Segment::create(entry, SegmentId::new(next_id as u8)) {
                Ok(segment) => {
                    segments.push(segment);
                    next_id += 1;
                }
                Err(e) => {
                    chunkbus_bb::error!("failed to create segment '{}': {:?}", entry.name, e);
                }
            }
        }

        Self { segments }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Every segment `user` may at least read, with a flag noting whether they may also write
    /// it. Segments `user` has no access to at all are omitted.
    pub fn segment_mappings(&self, user: &PosixUser) -> Vec<SegmentMapping> {
        self.segments
            .iter()
            .filter(|segment| segment.grants_read(user.group_ids()))
            .map(|segment| SegmentMapping {
                segment_name: segment.name().to_string(),
                size: segment.size(),
                is_writable: segment.grants_write(user.group_ids()),
                segment_id: segment.id(),
                memory_info: segment.memory_info().clone(),
            })
            .collect()
    }

    /// Resolves the segment `name` should be published into. If no segment with that name
    /// exists, or `user` lacks write access to it, falls back to the legacy behavior of matching
    /// `user`'s groups against segment names directly (see
    /// [`SegmentManager::writable_segment_by_group()`]).
    pub fn writable_segment_by_name(
        &self,
        name: &str,
        user: &PosixUser,
    ) -> Result<WritableSegment, SegmentLookupError> {
        if let Some(segment) = self.segments.iter().find(|s| s.name() == name) {
            if segment.grants_write(user.group_ids()) {
                return Ok(WritableSegment {
                    pool_set: segment.pool_set(),
                    segment_id: segment.id(),
                });
            }
            return Err(SegmentLookupError::NoWriteAccess);
        }

        self.writable_segment_by_group(user)
    }

    /// Legacy resolution kept for compatibility: a segment named after one of `user`'s groups,
    /// where that same group is also the segment's configured writer group. Iterates `user`'s
    /// group ids in the order [`PosixUser::group_ids()`] returns them and returns the first
    /// match; if a user belongs to more than one group that each name a writable segment, which
    /// one is returned depends on that order and is not otherwise defined.
    pub fn writable_segment_by_group(
        &self,
        user: &PosixUser,
    ) -> Result<WritableSegment, SegmentLookupError> {
        for &gid in user.group_ids() {
            let Ok(group) = PosixGroup::from_gid(gid) else {
                continue;
            };

            if let Some(segment) = self.segments.iter().find(|s| s.name() == group.name()) {
                if segment.writer_group_gid() == Some(gid) {
                    return Ok(WritableSegment {
                        pool_set: segment.pool_set(),
                        segment_id: segment.id(),
                    });
                }
            }
        }

        Err(SegmentLookupError::NoSegmentFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SegmentConfigError;
    use chunkbus_bb::testing::assert_that;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        reported: Mutex<Vec<SegmentConfigError>>,
    }

    impl FatalErrorSink for RecordingSink {
        fn report(&self, error: SegmentConfigError, _detail: &str) {
            self.reported.lock().unwrap().push(error);
        }
    }

    fn entry(name: &str) -> SegmentEntry {
        SegmentEntry {
            name: name.to_string(),
            reader_group: None,
            writer_group: None,
            pool_config: PoolConfig::new().add(128, 4),
            memory_info: MemoryInfo::default(),
        }
    }

    #[test]
    fn duplicate_segment_names_are_reported_and_the_second_entry_is_skipped() {
        let config = SegmentConfig::new()
            .add(entry("chunkbus-test-duplicate-a"))
            .add(entry("chunkbus-test-duplicate-a"));
        let sink = RecordingSink::default();

        let manager = SegmentManager::new_with_error_sink(&config, &sink);

        assert_that!(manager.segment_count(), eq 1);
        assert_that!(
            sink.reported.lock().unwrap().as_slice(),
            eq [SegmentConfigError::MultipleSegmentConfigEntriesWithSameName].as_slice()
        );
    }

    #[test]
    fn empty_config_yields_a_manager_with_no_segments() {
        let manager = SegmentManager::new(&SegmentConfig::new());
        assert_that!(manager.segment_count(), eq 0);
    }

    #[test]
    fn writable_segment_by_name_fails_with_no_segment_found_when_nothing_matches() {
        let manager = SegmentManager::new(&SegmentConfig::new());
        let user = PosixUser::from_self().expect("current process always has a user");
        assert_that!(
            manager.writable_segment_by_name("does-not-exist", &user),
            eq Err(SegmentLookupError::NoSegmentFound)
        );
    }
}
