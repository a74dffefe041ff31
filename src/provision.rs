//! Provisioning of the data and log directories.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use log::{debug, error};

use crate::identity::{IdentityResolver, Owner};

/// Name of the user owning the queue manager's files.
pub const MQM_USER: &str = "mqm";

/// Ensure `path` exists as a directory and, if the platform supports it, is
/// owned by `owner`.
pub fn ensure_directory(
    path: &Path,
    owner: Option<Owner>,
    resolver: &dyn IdentityResolver,
) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(..) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists but is not a directory", path.display()),
            ))
        }
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("creating directory: path={}", path.display());
            DirBuilder::new().recursive(true).mode(0o755).create(path)?;
        }
        Err(err) => return Err(err),
    }

    let owner = match owner {
        Some(owner) if resolver.is_supported() => owner,
        _ => return Ok(()),
    };
    match resolver.owner(path)? {
        Some(current) if current != owner => {
            debug!(
                "changing directory owner: path={}, owner={}, new_owner={}",
                path.display(),
                current,
                owner
            );
            resolver.set_owner(path, owner).map_err(|err| {
                error!("unable to change ownership of {}: {}", path.display(), err);
                err
            })
        }
        _ => Ok(()),
    }
}

/// Copy the file `src` to `dst`, creating `dst` if needed.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    debug!("copying file: src={}, dst={}", src.display(), dst.display());
    let mut input = File::open(src)?;
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o770)
        .open(dst)?;
    let n = io::copy(&mut input, &mut output)?;
    output.sync_all()?;
    Ok(n)
}
