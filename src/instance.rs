//! Checking we're the only running instance.
//!
//! Running two supervisors for the same queue manager would have both of them
//! starting it, so we refuse to start if another process running the same
//! program is found.

use std::fs;
use std::io;
use std::path::Path;

use log::debug;

/// Returns an error if another process with the same name as ours is
/// running.
///
/// Processes are found using `/proc`, if that isn't available the check is
/// skipped.
pub fn verify_single_instance() -> io::Result<()> {
    let name = match fs::read_to_string("/proc/self/comm") {
        Ok(name) => name,
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("not checking for other instances, /proc isn't available");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let name = name.trim_end();
    let others = find_instances(Path::new("/proc"), name, std::process::id())?;
    if others.is_empty() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "you cannot run more than one instance of {}: pids={:?}",
                name, others
            ),
        ))
    }
}

/// Find the processes in `proc_root` named `name`, excluding `own_pid`.
/// Returns the pids in ascending order.
pub fn find_instances(proc_root: &Path, name: &str, own_pid: u32) -> io::Result<Vec<u32>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(proc_root)? {
        let entry = entry?;
        let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
            Some(pid) if pid != own_pid => pid,
            _ => continue,
        };
        // The process can exit while we're looking at it.
        let comm = match fs::read_to_string(entry.path().join("comm")) {
            Ok(comm) => comm,
            Err(_) => continue,
        };
        if comm.trim_end() == name {
            found.push(pid);
        }
    }
    found.sort_unstable();
    debug!("found other instances: name={}, pids={:?}", name, found);
    Ok(found)
}
