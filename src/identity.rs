//! Platform identity resolution: user lookup and file ownership.
//!
//! Not every platform can (or needs to) resolve the ownership of files, see
//! [`IdentityResolver::is_supported`]. Use [`platform`] to get the resolver
//! for the current target, on unsupported platforms all operations are
//! no-ops.

use std::ffi::{CStr, CString};
use std::path::Path;
use std::{fmt, io, ptr};

use log::trace;

/// User and group id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Owner {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Resolves user identities and file ownership.
pub trait IdentityResolver {
    /// Whether or not this platform supports ownership resolution. If this
    /// returns `false` all other methods are no-ops.
    fn is_supported(&self) -> bool;

    /// Look up the user `name`, returning its user and primary group id.
    ///
    /// Returns `Ok(None)` if the platform is not supported.
    fn lookup_user(&self, name: &str) -> io::Result<Option<Owner>>;

    /// Returns the owner of `path`.
    ///
    /// Returns `Ok(None)` if the platform is not supported.
    fn owner(&self, path: &Path) -> io::Result<Option<Owner>>;

    /// Change the owner of `path` to `owner`.
    fn set_owner(&self, path: &Path, owner: Owner) -> io::Result<()>;
}

/// Returns the resolver for the current platform.
pub fn platform() -> &'static dyn IdentityResolver {
    #[cfg(target_os = "linux")]
    {
        &Unix
    }
    #[cfg(not(target_os = "linux"))]
    {
        &Unsupported
    }
}

/// Resolver using the Unix user database and file metadata.
#[derive(Copy, Clone, Debug)]
pub struct Unix;

impl IdentityResolver for Unix {
    fn is_supported(&self) -> bool {
        true
    }

    fn lookup_user(&self, name: &str) -> io::Result<Option<Owner>> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
        let mut buf: Vec<libc::c_char> = vec![0; 1024];
        loop {
            // SAFETY: all zero is valid for `passwd`.
            let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = ptr::null_mut();
            // SAFETY: all pointers are valid for the duration of the call,
            // `buf.len()` is the size of `buf`.
            let res = unsafe {
                libc::getpwnam_r(
                    c_name.as_ptr(),
                    &mut passwd,
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut result,
                )
            };
            match res {
                0 if result.is_null() => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("user {} not found", name),
                    ))
                }
                0 => {
                    let owner = Owner {
                        uid: passwd.pw_uid,
                        gid: passwd.pw_gid,
                    };
                    if !passwd.pw_name.is_null() {
                        // SAFETY: `getpwnam_r` returns NUL terminated strings.
                        let name = unsafe { CStr::from_ptr(passwd.pw_name) };
                        trace!("looked up user: name={:?}, owner={}", name, owner);
                    }
                    return Ok(Some(owner));
                }
                // Buffer too small.
                libc::ERANGE if buf.len() < 1 << 20 => buf.resize(buf.len() * 2, 0),
                libc::EINTR => continue,
                errno => return Err(io::Error::from_raw_os_error(errno)),
            }
        }
    }

    fn owner(&self, path: &Path) -> io::Result<Option<Owner>> {
        use std::os::unix::fs::MetadataExt;
        let metadata = path.metadata()?;
        Ok(Some(Owner {
            uid: metadata.uid(),
            gid: metadata.gid(),
        }))
    }

    fn set_owner(&self, path: &Path, owner: Owner) -> io::Result<()> {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
    }
}

/// Resolver for platforms without ownership support.
#[derive(Copy, Clone, Debug)]
pub struct Unsupported;

impl IdentityResolver for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }

    fn lookup_user(&self, _: &str) -> io::Result<Option<Owner>> {
        Ok(None)
    }

    fn owner(&self, _: &Path) -> io::Result<Option<Owner>> {
        Ok(None)
    }

    fn set_owner(&self, _: &Path, _: Owner) -> io::Result<()> {
        Ok(())
    }
}
