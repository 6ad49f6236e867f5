// Copyright (c) 2016-2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket activation: the supervisor binds and listens on a Unix-domain
//! socket on behalf of a service, and hands the pre-bound fd down at fork
//! so the service itself never needs bind/listen privileges (or needs to
//! race other instances for the bind).
//!
//! Mirrors `open_socket()`/`close_socket()` from the original
//! implementation: stat the path first so a stale (non-socket) file at
//! the target path is reported as an error rather than silently unlinked,
//! remove a stale socket left behind by an unclean shutdown, bind, set
//! ownership/permissions, then listen.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::{Error, Result};

const LISTEN_BACKLOG: i32 = 128;

/// Binds and listens on `path`, returning the fd. If a file already
/// exists at `path` and is not a socket, refuses rather than clobbering
/// it.
pub fn open_socket(path: &Path, owner: Option<(u32, u32)>, mode: Option<u32>) -> Result<RawFd> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            use std::os::unix::fs::FileTypeExt;
            if !meta.file_type().is_socket() {
                return Err(Error::ActivationSocketOccupied);
            }
            fs::remove_file(path).map_err(Error::Io)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::ActivationSocketOccupied)?;
    let bytes = c_path.as_bytes_with_nul();
    if bytes.len() > 108 {
        unsafe { libc::close(fd) };
        return Err(Error::Io(io::Error::from_raw_os_error(libc::ENAMETOOLONG)));
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (i, &b) in bytes.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }
    let addr_len = std::mem::size_of::<libc::sa_family_t>() + bytes.len();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }

    // chown before chmod: chowning a file after setgid/setuid bits are set
    // can silently clear those bits, per POSIX.
    if let Some((uid, gid)) = owner {
        let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
    }

    if let Some(m) = mode {
        let rc = unsafe { libc::chmod(c_path.as_ptr(), m as libc::mode_t) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
    }

    let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }

    Ok(fd)
}

/// Closes the fd and, if this was the last service instance using the
/// path, removes the socket file so a later instance doesn't see a stale
/// entry at an unexpected inode.
pub fn close_socket(fd: RawFd, path: &Path) {
    unsafe {
        libc::close(fd);
    }
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn refuses_non_socket_file_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notasocket");
        fs::write(&path, b"hi").unwrap();
        let result = open_socket(&path, None, None);
        assert!(matches!(result, Err(Error::ActivationSocketOccupied)));
    }

    #[test]
    fn removes_stale_socket_and_rebinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        {
            let _old = UnixListener::bind(&path).unwrap();
            // Dropped without removal, simulating an unclean shutdown --
            // the path persists as a bindable stale socket entry.
        }
        let fd = open_socket(&path, None, Some(0o600)).unwrap();
        assert!(fd >= 0);
        close_socket(fd, &path);
        assert!(!path.exists());
    }
}
