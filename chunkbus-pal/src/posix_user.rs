// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal POSIX user lookup: resolve the calling process's user id and the
//! set of group ids it belongs to. The segment manager consults this to
//! decide whether a caller may read or write a given segment.

use std::ffi::CStr;
use std::os::raw::c_char;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UserError {
    UserNotFound,
    InsufficientBufferSize,
    UnknownError(i32),
}

/// A resolved POSIX user: its uid and every group id it is a member of
/// (primary group included).
#[derive(Debug, Clone)]
pub struct PosixUser {
    uid: u32,
    group_ids: Vec<u32>,
}

impl PosixUser {
    /// Resolves the user the calling process is running as.
    pub fn from_self() -> Result<Self, UserError> {
        let uid = unsafe { libc::getuid() };
        Self::from_uid(uid)
    }

    pub fn from_uid(uid: u32) -> Result<Self, UserError> {
        let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let mut buffer = vec![0_i8; 16 * 1024];

        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut passwd,
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len(),
                &mut result,
            )
        };

        if rc == libc::ERANGE {
            return Err(UserError::InsufficientBufferSize);
        }
        if rc != 0 {
            return Err(UserError::UnknownError(rc));
        }
        if result.is_null() {
            return Err(UserError::UserNotFound);
        }

        let group_ids = Self::group_ids_for(uid, passwd.pw_gid, unsafe {
            CStr::from_ptr(passwd.pw_name)
        });

        Ok(Self { uid, group_ids })
    }

    fn group_ids_for(_uid: u32, primary_gid: u32, user_name: &CStr) -> Vec<u32> {
        let mut ngroups: libc::c_int = 32;
        loop {
            let mut groups = vec![0 as libc::gid_t; ngroups as usize];
            let rc = unsafe {
                libc::getgrouplist(
                    user_name.as_ptr(),
                    primary_gid,
                    groups.as_mut_ptr(),
                    &mut ngroups,
                )
            };

            if rc >= 0 {
                groups.truncate(ngroups as usize);
                return groups.into_iter().map(|g| g as u32).collect();
            }

            // buffer was too small, ngroups now holds the required size
            if ngroups <= 0 || ngroups as usize > 1 << 20 {
                return vec![primary_gid];
            }
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Every group id (including the primary group) this user belongs to.
    pub fn group_ids(&self) -> &[u32] {
        &self.group_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_calling_process_user() {
        let user = PosixUser::from_self().expect("current process always has a user");
        assert!(user.group_ids().len() >= 1);
    }
}
