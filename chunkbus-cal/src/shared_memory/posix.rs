// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! POSIX `shm_open`/`mmap` backed [`SharedMemory`]. A [`Builder`] either
//! creates a brand-new named shared memory object or opens an existing
//! one; both paths end with the region mapped into this process at
//! whatever address the kernel chooses, recorded as
//! [`PosixSharedMemory::base_address()`].

use super::{SharedMemory, SharedMemoryCreateError, SharedMemoryOpenError};
use chunkbus_bb::{fail, log::LogLevel};
use std::ffi::CString;
use std::os::unix::io::RawFd;

#[derive(Debug)]
pub struct PosixSharedMemory {
    name: CString,
    fd: RawFd,
    size: usize,
    base_address: usize,
    has_ownership: bool,
}

impl Drop for PosixSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base_address as *mut libc::c_void, self.size);
            libc::close(self.fd);
            if self.has_ownership {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

impl SharedMemory for PosixSharedMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn base_address(&self) -> usize {
        self.base_address
    }

    fn has_ownership(&self) -> bool {
        self.has_ownership
    }

    fn acquire_ownership(&mut self) {
        self.has_ownership = true;
    }

    fn release_ownership(&mut self) {
        self.has_ownership = false;
    }
}

/// Read/write permission granted to a named POSIX group, applied on top of
/// owner-only permissions on a newly created segment.
#[derive(Debug, Clone)]
pub struct GroupPermission {
    pub gid: u32,
    pub writable: bool,
}

#[derive(Debug)]
#[allow(dead_code)]
pub struct Builder {
    name: String,
    size: usize,
    reader_group: Option<GroupPermission>,
    writer_group: Option<GroupPermission>,
    has_ownership: bool,
}

impl Builder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            reader_group: None,
            writer_group: None,
            has_ownership: true,
        }
    }

    pub fn size(mut self, value: usize) -> Self {
        self.size = value;
        self
    }

    pub fn reader_group(mut self, gid: u32) -> Self {
        self.reader_group = Some(GroupPermission {
            gid,
            writable: false,
        });
        self
    }

    pub fn writer_group(mut self, gid: u32) -> Self {
        self.writer_group = Some(GroupPermission {
            gid,
            writable: true,
        });
        self
    }

    pub fn has_ownership(mut self, value: bool) -> Self {
        self.has_ownership = value;
        self
    }

    fn shm_name(&self) -> Result<CString, ()> {
        let name = if self.name.starts_with('/') {
            self.name.clone()
        } else {
            format!("/{}", self.name)
        };
        CString::new(name).map_err(|_| ())
    }

    /// Creates a brand-new named shared memory object of `self.size` bytes and maps it into
    /// this process. Fails if an object with this name already exists.
    pub fn create(self) -> Result<PosixSharedMemory, SharedMemoryCreateError> {
        let msg = "Unable to create shared memory";
        if self.size == 0 {
            fail!(from self, with SharedMemoryCreateError::SizeIsZero,
                "{} since the requested size is zero.", msg);
        }

        let c_name = self
            .shm_name()
            .map_err(|_| SharedMemoryCreateError::InternalError)?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd == -1 {
            let errno = unsafe { *libc::__errno_location() };
            return Err(match errno {
                libc::EEXIST => {
                    fail!(from self, with SharedMemoryCreateError::AlreadyExists,
                        "{} \"{}\" since it already exists.", msg, self.name);
                }
                libc::EACCES => SharedMemoryCreateError::InsufficientPermissions,
                _ => SharedMemoryCreateError::InternalError,
            });
        }

        if unsafe { libc::ftruncate(fd, self.size as libc::off_t) } != 0 {
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            fail!(from self, with SharedMemoryCreateError::InternalError,
                "{} \"{}\" since the resize to {} bytes failed.", msg, self.name, self.size);
        }

        self.apply_acl(fd);

        let base_address = self.map(fd)?;

        chunkbus_bb::log::__internal_print_log_msg(
            LogLevel::Debug,
            core::format_args!("{:?}", self),
            core::format_args!("created shared memory \"{}\" with {} bytes", self.name, self.size),
        );

        Ok(PosixSharedMemory {
            name: c_name,
            fd,
            size: self.size,
            base_address,
            has_ownership: self.has_ownership,
        })
    }

    /// Opens an already-existing named shared memory object and maps it into this process.
    pub fn open(self) -> Result<PosixSharedMemory, SharedMemoryOpenError> {
        let msg = "Unable to open shared memory";
        let c_name = self
            .shm_name()
            .map_err(|_| SharedMemoryOpenError::InternalError)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd == -1 {
            let errno = unsafe { *libc::__errno_location() };
            return Err(match errno {
                libc::ENOENT => {
                    fail!(from self, with SharedMemoryOpenError::DoesNotExist,
                        "{} \"{}\" since it does not exist.", msg, self.name);
                }
                libc::EACCES => SharedMemoryOpenError::InsufficientPermissions,
                _ => SharedMemoryOpenError::InternalError,
            });
        }

        let actual_size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                libc::close(fd);
                fail!(from self, with SharedMemoryOpenError::InternalError,
                    "{} \"{}\" since its size could not be determined.", msg, self.name);
            }
            stat.st_size as usize
        };

        if self.size != 0 && self.size != actual_size {
            unsafe { libc::close(fd) };
            fail!(from self, with SharedMemoryOpenError::SizeDoesNotFit,
                "{} \"{}\" since the requested size {} does not match the actual size {}.",
                msg, self.name, self.size, actual_size);
        }

        let base_address = match self.mmap_raw(fd, actual_size) {
            Ok(address) => address,
            Err(_) => {
                unsafe { libc::close(fd) };
                return Err(SharedMemoryOpenError::InternalError);
            }
        };

        Ok(PosixSharedMemory {
            name: c_name,
            fd,
            size: actual_size,
            base_address,
            has_ownership: false,
        })
    }

    fn map(&self, fd: RawFd) -> Result<usize, SharedMemoryCreateError> {
        self.mmap_raw(fd, self.size)
            .map_err(|_| SharedMemoryCreateError::InternalError)
    }

    fn mmap_raw(&self, fd: RawFd, size: usize) -> Result<usize, ()> {
        let address = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(());
        }
        Ok(address as usize)
    }

    /// Applies the permission scheme: owner read/write, the writer group (if any) read/write,
    /// the reader group (if any, and distinct from the writer group) read-only.
    /// This uses plain POSIX owner/group/other bits rather than a full multi-entry ACL — the
    /// mepoo segment this is grounded on grants distinct reader- and writer-group entries
    /// simultaneously via `PosixAcl`, which this simplified version cannot represent when both
    /// are configured and differ; it instead prefers the writer group's permissions in that case.
    fn apply_acl(&self, fd: RawFd) {
        let group = self
            .writer_group
            .as_ref()
            .or(self.reader_group.as_ref());

        if let Some(group) = group {
            unsafe {
                libc::fchown(fd, u32::MAX, group.gid);
            }
            let mode = if group.writable { 0o660 } else { 0o640 };
            unsafe {
                libc::fchmod(fd, mode);
            }
        }
    }
}

impl std::fmt::Display for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shared_memory::Builder {{ name: {} }}", self.name)
    }
}
