//! Collaborators managing the queue manager service.
//!
//! These are simple, sequential, operations: running the MQ control commands,
//! checking the license and writing the readiness and termination files.
//!
//! All commands are run using [`std::process::Command`] and waited on
//! directly, so they must finish before reaping is enabled in the supervisor.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use log::{debug, info, warn};

use crate::shutdown::ServiceStop;

/// Exit code of `crtmqm` if the queue manager already exists.
const QMGR_EXISTS: i32 = 8;

/// Default path of the readiness file.
pub const READY_FILE: &str = "/run/runmqserver/ready";

/// Default path of the termination log.
pub const TERMINATION_LOG: &str = "/run/termination-log";

/// Outcome of checking the `LICENSE` environment variable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum License {
    /// License is accepted.
    Accepted,
    /// The user asked to view the license.
    View,
    /// License is not accepted.
    NotAccepted,
}

impl License {
    /// Check the value of the `LICENSE` environment variable.
    pub fn check(value: Option<&str>) -> License {
        match value {
            Some("accept") => License::Accepted,
            Some("view") => License::View,
            _ => License::NotAccepted,
        }
    }
}

/// File signalling the queue manager is ready, used by the readiness probe.
#[derive(Debug)]
pub struct Readiness {
    path: PathBuf,
}

impl Readiness {
    /// Use `path` as readiness file.
    pub fn new<P>(path: P) -> Readiness
    where
        P: Into<PathBuf>,
    {
        Readiness { path: path.into() }
    }

    /// Remove the readiness file, if it exists.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Create the readiness file.
    pub fn set(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&self.path).map(|_| ())
    }

    /// Returns `true` if the readiness file exists.
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }
}

/// Write `msg` to the termination log at `path`.
///
/// This is best effort, failures are only logged.
pub fn write_termination_log(path: &Path, msg: &str) {
    let result = File::create(path).and_then(|mut file| writeln!(file, "{}", msg));
    if let Err(err) = result {
        warn!(
            "failed to write termination log: {}: path={}",
            err,
            path.display()
        );
    }
}

/// Error running a command.
#[derive(Debug)]
pub enum CommandError {
    /// Failed to start the command.
    Spawn {
        /// Program name.
        program: String,
        /// Reason.
        err: io::Error,
    },
    /// Command ran, but didn't succeed.
    Failed {
        /// Program name.
        program: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Standard error (or output if empty) of the command.
        output: String,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn { program, err } => {
                write!(f, "failed to run {}: {}", program, err)
            }
            CommandError::Failed {
                program,
                code: Some(code),
                output,
            } => write!(f, "{} failed with exit code {}: {}", program, code, output),
            CommandError::Failed {
                program, output, ..
            } => write!(f, "{} was killed: {}", program, output),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { err, .. } => Some(err),
            CommandError::Failed { .. } => None,
        }
    }
}

impl From<CommandError> for io::Error {
    fn from(err: CommandError) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err.to_string())
    }
}

/// Run `cmd`, optionally writing `stdin` to it, waiting for it to exit.
///
/// Exit codes in `allowed` are considered successful, as is zero.
pub fn run_command(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
    allowed: &[i32],
) -> Result<Output, CommandError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(
        "running command: program={}, args={:?}",
        program,
        cmd.get_args().collect::<Vec<_>>()
    );
    let spawn_err = |err| CommandError::Spawn {
        program: program.clone(),
        err,
    };
    let _ = cmd
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(spawn_err)?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // Dropping `pipe` closes standard in.
        pipe.write_all(input).map_err(spawn_err)?;
    }
    let output = child.wait_with_output().map_err(spawn_err)?;

    let code = output.status.code();
    debug!("command finished: program={}, code={:?}", program, code);
    match code {
        Some(0) => Ok(output),
        Some(code) if allowed.contains(&code) => Ok(output),
        code => {
            let text = if output.stderr.is_empty() {
                &output.stdout
            } else {
                &output.stderr
            };
            Err(CommandError::Failed {
                program,
                code,
                output: String::from_utf8_lossy(text).trim().to_owned(),
            })
        }
    }
}

/// Create the directory structure of the installation's variable data
/// directory, fixing up anything missing.
pub fn create_dir_structure() -> Result<(), CommandError> {
    let mut cmd = Command::new("crtmqdir");
    let _ = cmd.args(["-f", "-s"]);
    let _ = run_command(&mut cmd, None, &[])?;
    info!("created directory structure");
    Ok(())
}

/// The queue manager service, managed using the MQ control commands.
#[derive(Debug, Clone)]
pub struct QueueManager {
    name: String,
    data_dir: PathBuf,
    log_dir: PathBuf,
    /// Directory with `*.mqsc` files applied after starting.
    config_dir: PathBuf,
    /// Location of `mqs.ini`, passed to all commands.
    mqs_ini: PathBuf,
}

impl QueueManager {
    /// Queue manager `name`, with its data and logs in `data_root`.
    pub fn new(name: &str, data_root: &Path) -> QueueManager {
        QueueManager {
            name: name.to_owned(),
            data_dir: data_root.join("data"),
            log_dir: data_root.join("log"),
            config_dir: PathBuf::from("/etc/mqm"),
            mqs_ini: data_root.join("mqs.ini"),
        }
    }

    /// Returns a [`Command`] for `program`, setting up the environment.
    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        let _ = cmd.env("AMQ_MQS_INI_LOCATION", &self.mqs_ini);
        cmd
    }

    /// Name of the queue manager.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Log directory.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Location of the queue manager's `mqs.ini`.
    pub fn mqs_ini(&self) -> &Path {
        &self.mqs_ini
    }

    /// Create the queue manager. Returns `true` if it was created, `false` if
    /// it already existed.
    pub fn create(&self) -> Result<bool, CommandError> {
        info!("creating queue manager: name={}", self.name);
        let mut cmd = self.command("crtmqm");
        let _ = cmd
            .args(["-q", "-p", "1414", "-ld"])
            .arg(&self.log_dir)
            .arg("-md")
            .arg(&self.data_dir)
            .arg(&self.name);
        let output = run_command(&mut cmd, None, &[QMGR_EXISTS])?;
        let created = output.status.code() != Some(QMGR_EXISTS);
        if !created {
            info!("detected existing queue manager: name={}", self.name);
        }
        Ok(created)
    }

    /// Set the command level of the queue manager, it must not be running.
    pub fn update_command_level(&self, level: &str) -> Result<(), CommandError> {
        info!("setting command level: name={}, level={}", self.name, level);
        let _ = run_command(&mut self.command_level(level), None, &[])?;
        Ok(())
    }

    fn command_level(&self, level: &str) -> Command {
        let mut cmd = self.command("strmqm");
        let _ = cmd
            .arg("-e")
            .arg(format!("CMDLEVEL={}", level))
            .arg("-c")
            .arg(&self.name);
        cmd
    }

    /// Start the queue manager.
    pub fn start(&self) -> Result<(), CommandError> {
        info!("starting queue manager: name={}", self.name);
        let mut cmd = self.command("strmqm");
        let _ = cmd.arg(&self.name);
        run_command(&mut cmd, None, &[]).map(|_| ())
    }

    /// Apply all `*.mqsc` files in the configuration directory, in name order.
    pub fn configure(&self) -> Result<(), CommandError> {
        let mut files = match fs::read_dir(&self.config_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.extension().map_or(false, |ext| ext == "mqsc"))
                .collect::<Vec<_>>(),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(CommandError::Spawn {
                    program: "runmqsc".to_owned(),
                    err,
                })
            }
        };
        files.sort();
        for file in files {
            info!("applying MQSC file: path={}", file.display());
            let input = fs::read(&file).map_err(|err| CommandError::Spawn {
                program: "runmqsc".to_owned(),
                err,
            })?;
            let mut cmd = self.command("runmqsc");
            let _ = cmd.arg(&self.name);
            let _ = run_command(&mut cmd, Some(&input), &[])?;
        }
        Ok(())
    }

    /// End the queue manager, waiting for it to stop.
    pub fn end(&self) -> Result<(), CommandError> {
        info!("stopping queue manager: name={}", self.name);
        let mut cmd = self.command("endmqm");
        let _ = cmd.arg("-w").arg(&self.name);
        run_command(&mut cmd, None, &[]).map(|_| ())
    }
}

impl ServiceStop for QueueManager {
    fn stop_service(&mut self) -> io::Result<()> {
        self.end().map_err(io::Error::from)
    }
}
