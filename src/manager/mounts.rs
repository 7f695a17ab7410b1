//! Bind mounts for unit processes
//!
//! Runs between fork() and exec(): the child gets a private mount
//! namespace and each host path is bound over its container path.

use std::ffi::CString;
use std::io;

/// A mount binding converted ahead of fork so the child does not allocate
#[derive(Debug)]
pub struct PreparedMount {
    pub host: CString,
    pub container: CString,
    pub read_only: bool,
}

/// Apply all bind mounts for a unit.
/// Must be called after fork() but before exec().
pub fn apply_bind_mounts(mounts: &[PreparedMount]) -> io::Result<()> {
    create_mount_namespace()?;
    for mount in mounts {
        bind_mount(mount)?;
    }
    Ok(())
}

/// Create a new mount namespace with private propagation
fn create_mount_namespace() -> io::Result<()> {
    unsafe {
        if libc::unshare(libc::CLONE_NEWNS) != 0 {
            return Err(io::Error::last_os_error());
        }
        // Make all mounts private so changes don't propagate to the host
        if libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn bind_mount(mount: &PreparedMount) -> io::Result<()> {
    unsafe {
        if libc::mount(
            mount.host.as_ptr(),
            mount.container.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }

        // Read-only needs a second remount pass
        if mount.read_only
            && libc::mount(
                std::ptr::null(),
                mount.container.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_REC,
                std::ptr::null(),
            ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
