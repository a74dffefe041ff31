//! Mirroring of log files to the process's own output streams.
//!
//! Each mirrored log file gets its own worker thread, started with [`start`].
//! The worker waits for the file to exist, then copies any bytes appended to
//! it to its [`Destination`], re-opening the file when it's rotated or
//! truncated. Workers stop cooperatively once their [`CancelToken`] is
//! cancelled, after one final pass copying everything written up to that
//! point. [`MirrorTask::stop`] requests the stop and waits for the worker to
//! acknowledge it.
//!
//! Complete lines are written as soon as they're read, a partial last line is
//! held back until it's completed, or until the final pass, which writes it
//! as-is. Each line can be rendered using a [`LineFormat`] and prefixed with a
//! tag, see [`MirrorOptions`].
//!
//! # Rotation and truncation
//!
//! Rotation is detected by a change of the file's identity (device and inode),
//! truncation by the file's size dropping below the position we've read up
//! to. Both are checked once per poll, and after every read during the final
//! pass. A file that is truncated and then grows back beyond our position
//! between two checks can't be told apart from a file that was only appended
//! to, in that case mirroring resumes at the old position.

use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use std::{fmt, thread};

use crossbeam_channel::{self as crossbeam, RecvTimeoutError};
use log::{debug, error, trace, warn};
use serde::Deserialize;

use crate::cancel::{Cancel, CancelToken};

/// Default time between checks for new data.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Size of the buffer used to read from the source.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Where to start mirroring an existing source file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StartAt {
    /// Copy the entire file.
    Beginning,
    /// Only copy what is appended after the mirror started.
    ///
    /// If the file doesn't exist yet when the mirror starts, all of its
    /// content is new and it's copied from the beginning.
    End,
}

/// How mirrored lines are rendered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineFormat {
    /// Copy lines unchanged.
    Raw,
    /// Render JSON error log entries as `<ibm_datetime> <message>`. Lines that
    /// aren't an error log entry are copied unchanged.
    Simple,
}

/// Options for [`start`].
#[derive(Clone, Debug)]
pub struct MirrorOptions {
    /// Where to start copying.
    pub start_at: StartAt,
    /// Maximum time between checks for new data, cancellation is observed
    /// immediately.
    pub poll_interval: Duration,
    /// Prefix each line with `[tag] `.
    pub tag: Option<String>,
    /// How each line is rendered.
    pub format: LineFormat,
}

impl Default for MirrorOptions {
    fn default() -> MirrorOptions {
        MirrorOptions {
            start_at: StartAt::Beginning,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tag: None,
            format: LineFormat::Raw,
        }
    }
}

/// Stream mirrored bytes are written to.
pub struct Destination {
    name: String,
    writer: Box<dyn Write + Send>,
}

impl Destination {
    /// Standard out of the process.
    pub fn stdout() -> Destination {
        Destination::new("stdout", io::stdout())
    }

    /// Standard error of the process.
    pub fn stderr() -> Destination {
        Destination::new("stderr", io::stderr())
    }

    /// Use `writer` as destination, `name` is used in logging.
    pub fn new<W>(name: &str, writer: W) -> Destination
    where
        W: Write + Send + 'static,
    {
        Destination {
            name: name.to_owned(),
            writer: Box::new(writer),
        }
    }

    /// Name of the destination.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .finish()
    }
}

/// Acknowledgement of a stopped worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MirrorExit {
    /// Stopped after cancellation, all data was copied and flushed.
    Cancelled {
        /// Total number of bytes read from the source.
        copied: u64,
    },
    /// Stopped early because the source couldn't be read, or the destination
    /// couldn't be written. The error is logged by the worker.
    Failed,
}

/// Handle to a running log mirror worker.
#[derive(Debug)]
pub struct MirrorTask {
    source: PathBuf,
    destination: String,
    handle: thread::JoinHandle<()>,
    /// Receives the worker's acknowledgement once it stops.
    done: crossbeam::Receiver<MirrorExit>,
}

/// Start mirroring `source` to `destination` on a new thread, until `cancel`
/// is cancelled.
///
/// Only returns an error if the thread can't be spawned; problems with the
/// source are handled (and logged) by the worker.
pub fn start(
    source: PathBuf,
    destination: Destination,
    cancel: CancelToken,
    options: MirrorOptions,
) -> io::Result<MirrorTask> {
    let (sender, done) = crossbeam::bounded(1);
    let destination_name = destination.name.clone();
    let worker = Worker {
        source: source.clone(),
        destination,
        cancel,
        options,
    };
    let name = match source.file_name() {
        Some(name) => format!("mirror:{}", name.to_string_lossy()),
        None => "mirror".to_owned(),
    };
    debug!(
        "starting log mirror: source={}, destination={}",
        source.display(),
        destination_name
    );
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let exit = worker.run();
            // Can't fail: the channel has room for one message and we only
            // send once. If the task is already dropped nobody cares.
            let _ = sender.try_send(exit);
        })
        .map(|handle| MirrorTask {
            source,
            destination: destination_name,
            handle,
            done,
        })
}

impl MirrorTask {
    /// Path of the mirrored file.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Name of the destination stream.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Returns `true` if the worker has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request the worker to stop, using the shared `cancel`, and wait for it
    /// to acknowledge.
    ///
    /// If `deadline` is `None` this waits without bound, otherwise it returns
    /// [`StopError::Timeout`] if the worker didn't acknowledge in time. In
    /// that case the thread is left running, detached.
    pub fn stop(self, cancel: &Cancel, deadline: Option<Instant>) -> Result<MirrorExit, StopError> {
        let _ = cancel.cancel();
        let result = match deadline {
            Some(deadline) => self.done.recv_deadline(deadline),
            None => self.done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match result {
            Ok(exit) => {
                // Acknowledgement is the last thing the worker does.
                if let Err(err) = self.handle.join() {
                    warn!(
                        "log mirror panicked after acknowledging stop: source={}, panic={}",
                        self.source.display(),
                        crate::panic_message(&*err)
                    );
                }
                trace!(
                    "log mirror stopped: source={}, exit={:?}",
                    self.source.display(),
                    exit
                );
                Ok(exit)
            }
            Err(RecvTimeoutError::Timeout) => Err(StopError::Timeout),
            Err(RecvTimeoutError::Disconnected) => match self.handle.join() {
                Err(err) => Err(StopError::Panicked(crate::panic_message(&*err).to_owned())),
                // Worker always sends before returning.
                Ok(()) => Err(StopError::Panicked("no acknowledgement".to_owned())),
            },
        }
    }
}

/// Error returned by [`MirrorTask::stop`].
#[derive(Debug, Eq, PartialEq)]
pub enum StopError {
    /// Worker didn't acknowledge before the deadline.
    Timeout,
    /// Worker thread panicked.
    Panicked(String),
}

impl fmt::Display for StopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopError::Timeout => f.write_str("log mirror didn't acknowledge stop in time"),
            StopError::Panicked(msg) => write!(f, "log mirror panicked: {}", msg),
        }
    }
}

impl std::error::Error for StopError {}

/// State owned by the worker thread.
struct Worker {
    source: PathBuf,
    destination: Destination,
    cancel: CancelToken,
    options: MirrorOptions,
}

impl Worker {
    /// Run the worker until cancelled or the source turns out unreadable.
    fn run(mut self) -> MirrorExit {
        match self.mirror() {
            Ok(copied) => {
                debug!(
                    "log mirror cancelled: source={}, copied={}",
                    self.source.display(),
                    copied
                );
                MirrorExit::Cancelled { copied }
            }
            Err(err) => {
                error!(
                    "failed to mirror log: {}: source={}, destination={}",
                    err,
                    self.source.display(),
                    self.destination.name
                );
                let _ = self.destination.writer.flush();
                MirrorExit::Failed
            }
        }
    }

    fn mirror(&mut self) -> io::Result<u64> {
        let mut tail = match self.open()? {
            Some(tail) => tail,
            None => return Ok(0),
        };

        loop {
            tail.drain(&mut self.destination.writer, &self.options)?;
            self.destination.writer.flush()?;

            if self.cancel.wait_timeout(self.options.poll_interval) {
                trace!("final log mirror pass: source={}", self.source.display());
                tail.drain(&mut self.destination.writer, &self.options)?;
                tail.flush_partial(&mut self.destination.writer, &self.options)?;
                self.destination.writer.flush()?;
                return Ok(tail.copied);
            }
        }
    }

    /// Open the source, waiting for it to be created.
    ///
    /// Returns `None` if cancelled before the source exists.
    fn open(&self) -> io::Result<Option<Tail>> {
        let mut waited = false;
        loop {
            // If we had to wait for the file to be created everything in it
            // is new.
            let start_at = if waited {
                StartAt::Beginning
            } else {
                self.options.start_at
            };
            match Tail::open(&self.source, start_at) {
                Ok(tail) => return Ok(Some(tail)),
                Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
                    if !waited {
                        debug!(
                            "waiting for log file to be created: source={}",
                            self.source.display()
                        );
                    }
                    waited = true;
                    if self.cancel.wait_timeout(self.options.poll_interval) {
                        // It could have been created just before we got
                        // cancelled.
                        return match Tail::open(&self.source, StartAt::Beginning) {
                            Ok(tail) => Ok(Some(tail)),
                            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                            Err(err) => Err(err),
                        };
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Identity of a file, used to detect rotation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    fn of(metadata: &Metadata) -> FileId {
        FileId {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// Open source file and the position we've read it up to.
struct Tail {
    path: PathBuf,
    file: File,
    id: FileId,
    /// Number of bytes read from `file`.
    offset: u64,
    /// Total number of bytes read from all files.
    copied: u64,
    /// Bytes read but not yet written, always a partial line.
    pending: Vec<u8>,
    buf: Box<[u8]>,
}

impl Tail {
    fn open(path: &Path, start_at: StartAt) -> io::Result<Tail> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "log source is a directory",
            ));
        }
        let offset = match start_at {
            StartAt::Beginning => 0,
            StartAt::End => file.seek(SeekFrom::End(0))?,
        };
        trace!(
            "opened log source: source={}, offset={}",
            path.display(),
            offset
        );
        Ok(Tail {
            path: path.to_owned(),
            file,
            id: FileId::of(&metadata),
            offset,
            copied: 0,
            pending: Vec::new(),
            buf: vec![0; READ_BUF_SIZE].into_boxed_slice(),
        })
    }

    /// Copy everything currently available, following the file through any
    /// number of rotations and truncations.
    fn drain(&mut self, dst: &mut dyn Write, opts: &MirrorOptions) -> io::Result<()> {
        loop {
            self.copy_new(dst, opts)?;
            if !self.follow_rotation(dst, opts)? {
                return Ok(());
            }
        }
    }

    /// Copy all bytes currently available in the file, writing all complete
    /// lines to `dst`.
    fn copy_new(&mut self, dst: &mut dyn Write, opts: &MirrorOptions) -> io::Result<()> {
        loop {
            let n = match self.file.read(&mut self.buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            self.offset += n as u64;
            self.copied += n as u64;
            self.pending.extend_from_slice(&self.buf[..n]);

            if let Some(last) = self.pending.iter().rposition(|b| *b == b'\n') {
                let rest = self.pending.split_off(last + 1);
                write_lines(dst, &self.pending, opts)?;
                self.pending = rest;
            }
        }
    }

    /// Write out a partial line, if any.
    fn flush_partial(&mut self, dst: &mut dyn Write, opts: &MirrorOptions) -> io::Result<()> {
        if !self.pending.is_empty() {
            write_lines(dst, &self.pending, opts)?;
            self.pending.clear();
        }
        Ok(())
    }

    /// Check if the file was truncated or replaced, if so continue with the
    /// new file from the beginning. Returns `true` if that happened, in which
    /// case the new file hasn't been read yet.
    fn follow_rotation(&mut self, dst: &mut dyn Write, opts: &MirrorOptions) -> io::Result<bool> {
        let current = match self.path.metadata() {
            Ok(metadata) => metadata,
            // Rotated away but not yet recreated, keep reading the old file.
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };

        if FileId::of(&current) != self.id {
            debug!("log file rotated: source={}", self.path.display());
            // Anything written to the old file after our last read.
            self.copy_new(dst, opts)?;
            self.flush_partial(dst, opts)?;
            self.file = File::open(&self.path)?;
            self.id = FileId::of(&self.file.metadata()?);
            self.offset = 0;
            Ok(true)
        } else if current.len() < self.offset {
            debug!(
                "log file truncated: source={}, size={}, offset={}",
                self.path.display(),
                current.len(),
                self.offset
            );
            self.flush_partial(dst, opts)?;
            let _ = self.file.seek(SeekFrom::Start(0))?;
            self.offset = 0;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Entry in a JSON error log, only the fields we render.
#[derive(Deserialize)]
struct ErrorLogEntry {
    ibm_datetime: String,
    message: String,
}

/// Write `data` to `dst`, rendering each line according to `opts`.
fn write_lines(dst: &mut dyn Write, data: &[u8], opts: &MirrorOptions) -> io::Result<()> {
    if opts.tag.is_none() && opts.format == LineFormat::Raw {
        return dst.write_all(data);
    }
    for line in data.split_inclusive(|b| *b == b'\n') {
        if let Some(tag) = &opts.tag {
            write!(dst, "[{}] ", tag)?;
        }
        match opts.format {
            LineFormat::Raw => dst.write_all(line)?,
            LineFormat::Simple => write_simple(dst, line)?,
        }
    }
    Ok(())
}

/// Write `line` as `<ibm_datetime> <message>`, or as-is if it isn't an error
/// log entry.
fn write_simple(dst: &mut dyn Write, line: &[u8]) -> io::Result<()> {
    let (content, newline) = match line.strip_suffix(b"\n") {
        Some(content) => (content, true),
        None => (line, false),
    };
    match serde_json::from_slice::<ErrorLogEntry>(content) {
        Ok(entry) => {
            write!(dst, "{} {}", entry.ibm_datetime, entry.message)?;
            if newline {
                dst.write_all(b"\n")?;
            }
            Ok(())
        }
        Err(_) => dst.write_all(line),
    }
}
