#![allow(dead_code, unused_macros)] // Not all tests use all functions/types.

use std::fs::{create_dir_all, remove_dir_all, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

use qminit::mirror::Destination;

macro_rules! limited_loop {
    ($($arg: tt)*) => {{
        let mut range = (0..1_000);
        while range.next().is_some() {
            $($arg)*
        }

        if range.is_empty() {
            panic!("looped too many iterations");
        }
    }}
}

pub fn assert_send<T: Send>() {}

pub fn assert_sync<T: Sync>() {}

/// Returns a path to a non-existing temporary file.
pub fn temp_file(name: &str) -> PathBuf {
    let mut dir = temp_dir_root();
    dir.push(name);
    dir
}

/// Returns a path to a non-existing temporary directory.
pub fn temp_dir(name: &str) -> PathBuf {
    temp_file(name)
}

/// Returns the path to root of our temporary directory, cleaned before each
/// test run.
pub fn temp_dir_root() -> PathBuf {
    static CLEANUP: Once = Once::new();

    let mut dir = std::env::temp_dir();
    dir.push(format!("qminit.test.{}/", std::process::id()));

    CLEANUP.call_once(|| {
        let _ = remove_dir_all(&dir);
        if let Err(err) = create_dir_all(&dir) {
            panic!("failed to create temporary directory: {}", err);
        }
    });

    dir
}

/// Append `data` to the file at `path`, creating it if needed.
pub fn append(path: &Path, data: &[u8]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("failed to open file");
    file.write_all(data).expect("failed to write to file");
}

/// Shared, in-memory, output for a mirror [`Destination`].
#[derive(Clone, Debug, Default)]
pub struct Output {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Output {
    pub fn new() -> Output {
        Output::default()
    }

    pub fn destination(&self, name: &str) -> Destination {
        Destination::new(name, self.clone())
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Destination that blocks on its first write until `release` is called,
/// used to keep a worker from acknowledging its stop.
#[derive(Clone, Debug)]
pub struct Blocking {
    gate: Arc<(Mutex<bool>, std::sync::Condvar)>,
}

impl Blocking {
    pub fn new() -> Blocking {
        Blocking {
            gate: Arc::new((Mutex::new(false), std::sync::Condvar::new())),
        }
    }

    pub fn destination(&self) -> Destination {
        Destination::new("blocking", self.clone())
    }

    pub fn release(&self) {
        let (lock, cvar) = &*self.gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

impl Write for Blocking {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.gate;
        let mut released = lock.lock().unwrap();
        while !*released {
            released = cvar.wait(released).unwrap();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
