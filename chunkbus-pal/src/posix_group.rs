// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal POSIX group lookup: resolve a group name to a group id. Used by
//! the segment manager when building the ACL for a newly created segment
//! and when matching a user's groups against a segment's reader/writer
//! group name.

use std::ffi::CString;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GroupError {
    GroupNotFound,
    InvalidGroupName,
    UnknownError(i32),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PosixGroup {
    gid: u32,
    name: String,
}

impl PosixGroup {
    /// Resolves a group by numeric id, the reverse of [`PosixGroup::from_name()`]. Used by the
    /// segment manager's legacy "implicit segment by group" resolution, which needs the name a
    /// group id maps to in order to compare it against segment names.
    pub fn from_gid(gid: u32) -> Result<Self, GroupError> {
        let mut group: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let mut buffer = vec![0_i8; 16 * 1024];

        let rc = unsafe {
            libc::getgrgid_r(
                gid,
                &mut group,
                buffer.as_mut_ptr() as *mut _,
                buffer.len(),
                &mut result,
            )
        };

        if rc != 0 {
            return Err(GroupError::UnknownError(rc));
        }
        if result.is_null() {
            return Err(GroupError::GroupNotFound);
        }

        let name = unsafe { std::ffi::CStr::from_ptr(group.gr_name) }
            .to_string_lossy()
            .into_owned();

        Ok(Self { gid, name })
    }

    pub fn from_name(name: &str) -> Result<Self, GroupError> {
        let c_name = CString::new(name).map_err(|_| GroupError::InvalidGroupName)?;

        let mut group: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let mut buffer = vec![0_i8; 16 * 1024];

        let rc = unsafe {
            libc::getgrnam_r(
                c_name.as_ptr(),
                &mut group,
                buffer.as_mut_ptr() as *mut _,
                buffer.len(),
                &mut result,
            )
        };

        if rc != 0 {
            return Err(GroupError::UnknownError(rc));
        }
        if result.is_null() {
            return Err(GroupError::GroupNotFound);
        }

        Ok(Self {
            gid: group.gr_gid,
            name: name.to_string(),
        })
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_group_name_fails() {
        let result = PosixGroup::from_name("chunkbus-nonexistent-group-xyz");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_gid_fails() {
        let result = PosixGroup::from_gid(u32::MAX - 1);
        assert!(result.is_err());
    }
}
