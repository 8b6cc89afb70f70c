// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A named, access-controlled shared-memory region hosting one
//! [`MemPoolCollection`]. Every chunk inside it is addressed, across
//! processes, by `{segment_id, offset}` rather than by raw pointer —
//! `Segment` is the thing that knows how to turn such an offset back into
//! this process's local mapping.

use crate::error::SegmentCreationError;
use crate::mem_pool_collection::{MemPoolCollection, PoolConfig, PoolSet};
use crate::segment_manager::{MemoryInfo, SegmentEntry};
use chunkbus_bb::math::align;
use chunkbus_cal::shared_memory::posix::{Builder as ShmBuilder, PosixSharedMemory};
use chunkbus_cal::shared_memory::SharedMemory;
use chunkbus_cal::shm_allocator::SegmentId;
use chunkbus_pal::posix_group::PosixGroup;
use std::sync::Arc;

const MAX_POOLS_PER_SEGMENT: usize = 16;
const SEGMENT_MAGIC: u64 = 0x4348_5542_4B53_5331; // "CHUBKSS1", an arbitrary fixed tag
const SEGMENT_FORMAT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PoolMetadata {
    chunk_size: u32,
    chunk_count: u32,
}

/// One subject an ACL entry grants access to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AclSubject {
    Owner,
    Group(u32),
    Others,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AclEntry {
    pub subject: AclSubject,
    pub read: bool,
    pub write: bool,
}

/// The reader/writer group configuration a segment was created with, translated into explicit
/// ACL entries the way `mepoo_segment.inl` emits them: owner and "others" entries are always
/// present, even though both happen to match the POSIX default, so the emitted ACL is
/// self-documenting.
#[derive(Debug, Clone, Copy)]
pub struct SegmentPermissions {
    pub reader_group_gid: Option<u32>,
    pub writer_group_gid: Option<u32>,
}

impl SegmentPermissions {
    pub fn to_acl_entries(&self) -> Vec<AclEntry> {
        let mut entries = vec![AclEntry {
            subject: AclSubject::Owner,
            read: true,
            write: true,
        }];

        if let Some(gid) = self.writer_group_gid {
            entries.push(AclEntry {
                subject: AclSubject::Group(gid),
                read: true,
                write: true,
            });
        }
        if let Some(gid) = self.reader_group_gid {
            if self.writer_group_gid != Some(gid) {
                entries.push(AclEntry {
                    subject: AclSubject::Group(gid),
                    read: true,
                    write: false,
                });
            }
        }

        entries.push(AclEntry {
            subject: AclSubject::Others,
            read: false,
            write: false,
        });
        entries
    }
}

/// Written to the first bytes of every segment's backing shared memory. Informational: nothing
/// in this crate re-derives pool configuration or permissions from it at runtime (both are kept
/// in the owning process's [`Segment`]), but it keeps the wire format self-describing, matching
/// the original's segment base-page layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    magic: u64,
    version: u32,
    pool_count: u32,
    pools: [PoolMetadata; MAX_POOLS_PER_SEGMENT],
    administrative_area_offset: u64,
    chunk_header_area_offset: u64,
    payload_area_offset: u64,
    acl_owner_read_write: u8,
    acl_writer_group_present: u8,
    acl_writer_group_gid: u32,
    acl_reader_group_present: u8,
    acl_reader_group_gid: u32,
}

impl SegmentHeader {
    fn new(pool_config: &PoolConfig, permissions: &SegmentPermissions, chunk_area_offset: usize) -> Self {
        let mut sorted = pool_config.entries.clone();
        sorted.sort_by_key(|e| e.chunk_size);
        assert!(
            sorted.len() <= MAX_POOLS_PER_SEGMENT,
            "pool count exceeds the fixed-size segment header slot count"
        );

        let mut pools = [PoolMetadata::default(); MAX_POOLS_PER_SEGMENT];
        for (slot, entry) in pools.iter_mut().zip(sorted.iter()) {
            *slot = PoolMetadata {
                chunk_size: entry.chunk_size as u32,
                chunk_count: entry.chunk_count as u32,
            };
        }

        Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_FORMAT_VERSION,
            pool_count: sorted.len() as u32,
            pools,
            administrative_area_offset: 0,
            chunk_header_area_offset: chunk_area_offset as u64,
            payload_area_offset: chunk_area_offset as u64,
            acl_owner_read_write: 1,
            acl_writer_group_present: permissions.writer_group_gid.is_some() as u8,
            acl_writer_group_gid: permissions.writer_group_gid.unwrap_or(0),
            acl_reader_group_present: permissions.reader_group_gid.is_some() as u8,
            acl_reader_group_gid: permissions.reader_group_gid.unwrap_or(0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.version == SEGMENT_FORMAT_VERSION
    }
}

fn resolve_group(name: &str) -> Result<u32, SegmentCreationError> {
    PosixGroup::from_name(name)
        .map(|g| g.gid())
        .map_err(|_| SegmentCreationError::UnknownGroup)
}

fn shm_name_for(segment_name: &str) -> String {
    format!("chunkbus-segment-{segment_name}")
}

/// A named, access-controlled shared-memory segment hosting one [`MemPoolCollection`].
#[derive(Debug)]
pub struct Segment {
    name: String,
    id: SegmentId,
    reader_group_gid: Option<u32>,
    writer_group_gid: Option<u32>,
    memory_info: MemoryInfo,
    shm: PosixSharedMemory,
    pools: Arc<MemPoolCollection>,
}

impl Segment {
    pub fn required_management_memory_size(_pool_config: &PoolConfig) -> usize {
        core::mem::size_of::<SegmentHeader>()
    }

    pub fn required_chunk_memory_size(pool_config: &PoolConfig) -> usize {
        pool_config
            .entries
            .iter()
            .map(|e| e.chunk_size * e.chunk_count)
            .sum()
    }

    pub fn required_full_memory_size(pool_config: &PoolConfig) -> usize {
        align(
            Self::required_management_memory_size(pool_config)
                + Self::required_chunk_memory_size(pool_config),
            core::mem::align_of::<SegmentHeader>(),
        )
    }

    pub(crate) fn create(entry: &SegmentEntry, id: SegmentId) -> Result<Self, SegmentCreationError> {
        let reader_group_gid = entry
            .reader_group
            .as_deref()
            .map(resolve_group)
            .transpose()?;
        let writer_group_gid = entry
            .writer_group
            .as_deref()
            .map(resolve_group)
            .transpose()?;

        let full_size = Self::required_full_memory_size(&entry.pool_config);
        let mut builder = ShmBuilder::new(&shm_name_for(&entry.name)).size(full_size);
        if let Some(gid) = writer_group_gid {
            builder = builder.writer_group(gid);
        }
        if reader_group_gid.is_some() && reader_group_gid != writer_group_gid {
            builder = builder.reader_group(reader_group_gid.unwrap());
        }

        let shm = builder
            .create()
            .map_err(|_| SegmentCreationError::SharedMemoryCreationFailed)?;

        let base_address = shm.base_address();
        let admin_size = Self::required_management_memory_size(&entry.pool_config);

        let permissions = SegmentPermissions {
            reader_group_gid,
            writer_group_gid,
        };
        let header = SegmentHeader::new(&entry.pool_config, &permissions, admin_size);
        unsafe { (base_address as *mut SegmentHeader).write(header) };

        let pools = unsafe { MemPoolCollection::new(&entry.pool_config, admin_size, base_address) };

        Ok(Self {
            name: entry.name.clone(),
            id,
            reader_group_gid,
            writer_group_gid,
            memory_info: entry.memory_info.clone(),
            shm,
            pools: Arc::new(pools),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn memory_info(&self) -> &MemoryInfo {
        &self.memory_info
    }

    pub fn size(&self) -> usize {
        self.shm.size()
    }

    pub(crate) fn grants_read(&self, group_ids: &[u32]) -> bool {
        self.grants_write(group_ids)
            || self
                .reader_group_gid
                .is_some_and(|gid| group_ids.contains(&gid))
    }

    pub(crate) fn grants_write(&self, group_ids: &[u32]) -> bool {
        self.writer_group_gid
            .is_some_and(|gid| group_ids.contains(&gid))
    }

    pub(crate) fn writer_group_gid(&self) -> Option<u32> {
        self.writer_group_gid
    }

    pub fn pool_set(&self) -> PoolSet {
        PoolSet::new(Arc::clone(&self.pools), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkbus_bb::testing::assert_that;

    #[test]
    fn segment_permissions_emit_one_group_entry_when_reader_and_writer_match() {
        let permissions = SegmentPermissions {
            reader_group_gid: Some(42),
            writer_group_gid: Some(42),
        };
        let entries = permissions.to_acl_entries();
        let group_entries: Vec<_> = entries
            .iter()
            .filter(|e| matches!(e.subject, AclSubject::Group(_)))
            .collect();
        assert_that!(group_entries.len(), eq 1);
        assert_that!(group_entries[0].read, is_true);
        assert_that!(group_entries[0].write, is_true);
    }

    #[test]
    fn segment_permissions_emit_distinct_entries_for_distinct_reader_and_writer_groups() {
        let permissions = SegmentPermissions {
            reader_group_gid: Some(1),
            writer_group_gid: Some(2),
        };
        let entries = permissions.to_acl_entries();
        let group_entries: Vec<_> = entries
            .iter()
            .filter(|e| matches!(e.subject, AclSubject::Group(_)))
            .collect();
        assert_that!(group_entries.len(), eq 2);
    }

    #[test]
    fn segment_permissions_always_include_explicit_owner_and_others_entries() {
        let permissions = SegmentPermissions {
            reader_group_gid: None,
            writer_group_gid: None,
        };
        let entries = permissions.to_acl_entries();
        assert!(entries.iter().any(|e| e.subject == AclSubject::Owner && e.read && e.write));
        assert!(entries
            .iter()
            .any(|e| e.subject == AclSubject::Others && !e.read && !e.write));
    }

    #[test]
    fn required_chunk_memory_size_sums_every_pool() {
        let config = PoolConfig::new().add(128, 4).add(256, 2);
        assert_that!(Segment::required_chunk_memory_size(&config), eq 128 * 4 + 256 * 2);
    }
}
