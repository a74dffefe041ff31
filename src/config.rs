//! Configuration, read from environment variables.
//!
//! All variables are optional. If a variable has an invalid value a warning
//! is logged and the default is used instead.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::mirror::DEFAULT_POLL_INTERVAL;

/// Maximum length of a queue manager name.
const MAX_QMGR_NAME_LEN: usize = 48;

/// Log output format of the process itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    /// Human readable, `key=value` pairs.
    Basic,
    /// One JSON object per line.
    Json,
}

/// Effective configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Name of the queue manager.
    pub qmgr_name: String,
    /// Value of `LICENSE`, if set.
    pub license: Option<String>,
    /// Output format of our own logs.
    pub log_format: LogFormat,
    /// Enable debug logging.
    pub debug: bool,
    /// Whether metrics collection was requested.
    pub metrics: bool,
    /// Time between polls of a mirrored log file.
    pub mirror_poll_interval: Duration,
    /// Prefix mirrored lines with their source.
    pub mirror_tag_source: bool,
    /// Maximum time to wait for the log mirrors to stop, `None` means without
    /// bound.
    pub shutdown_grace: Option<Duration>,
    /// Time between the service being started and reaping being enabled.
    pub reap_delay: Duration,
    /// Root of the volume holding the queue manager's data.
    pub data_root: PathBuf,
    /// Root of the MQ installation's variable data.
    pub var_root: PathBuf,
    /// Command level to set before starting the queue manager, if any.
    pub cmd_level: Option<String>,
}

impl Config {
    /// Environment variable holding the queue manager name.
    pub const QMGR_NAME: &'static str = "MQ_QMGR_NAME";
    const LICENSE: &'static str = "LICENSE";
    const LOG_FORMAT: &'static str = "LOG_FORMAT";
    const DEBUG: &'static str = "DEBUG";
    const METRICS: &'static str = "MQ_ENABLE_METRICS";
    const MIRROR_POLL_INTERVAL: &'static str = "MQ_MIRROR_POLL_INTERVAL";
    const MIRROR_TAG_SOURCE: &'static str = "MQ_MIRROR_TAG_SOURCE";
    const SHUTDOWN_GRACE: &'static str = "MQ_SHUTDOWN_GRACE";
    const REAP_DELAY: &'static str = "MQ_REAP_DELAY";
    const DATA_ROOT: &'static str = "MQ_DATA_ROOT";
    const VAR_ROOT: &'static str = "MQ_VAR_ROOT";
    const CMD_LEVEL: &'static str = "MQ_CMDLEVEL";

    /// Read the configuration from the process's environment.
    ///
    /// Problems with the configuration are logged, so logging should be
    /// initialised first, see [`Config::log_settings`].
    pub fn from_env() -> Config {
        Config::from_vars(std::env::vars_os(), hostname)
    }

    /// Read only the logging configuration, the format and whether to log
    /// debug messages, from `vars`. Invalid values are silently ignored,
    /// [`Config::from_vars`] reports them.
    pub fn log_settings<I>(vars: I) -> (LogFormat, bool)
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut format = LogFormat::Basic;
        let mut debug = false;
        for (key, value) in vars {
            match key.to_str() {
                Some(Config::LOG_FORMAT) => {
                    if let Some(f) = parse_log_format(&value) {
                        format = f;
                    }
                }
                Some(Config::DEBUG) => debug = is_true(&value),
                _ => {}
            }
        }
        (format, debug)
    }

    /// Create the configuration from `vars`, using `hostname` to determine
    /// the default queue manager name.
    pub fn from_vars<I, H>(vars: I, hostname: H) -> Config
    where
        I: IntoIterator<Item = (OsString, OsString)>,
        H: FnOnce() -> Option<String>,
    {
        let mut config = Config::default();
        let mut qmgr_name = None;
        for (key, value) in vars {
            let key = match key.to_str() {
                Some(key) => key,
                None => continue,
            };
            match key {
                Config::QMGR_NAME => qmgr_name = Some(value.to_string_lossy().into_owned()),
                Config::LICENSE => config.license = Some(value.to_string_lossy().into_owned()),
                Config::LOG_FORMAT => match parse_log_format(&value) {
                    Some(format) => config.log_format = format,
                    None => invalid(key, &value),
                },
                Config::DEBUG => config.debug = is_true(&value),
                Config::METRICS => config.metrics = is_true(&value),
                Config::MIRROR_POLL_INTERVAL => match parse_os_string::<u64>(&value) {
                    Ok(millis) if millis > 0 => {
                        config.mirror_poll_interval = Duration::from_millis(millis)
                    }
                    _ => invalid(key, &value),
                },
                Config::MIRROR_TAG_SOURCE => config.mirror_tag_source = is_true(&value),
                Config::SHUTDOWN_GRACE => match parse_os_string::<u64>(&value) {
                    Ok(0) => config.shutdown_grace = None,
                    Ok(secs) => config.shutdown_grace = Some(Duration::from_secs(secs)),
                    Err(()) => invalid(key, &value),
                },
                Config::REAP_DELAY => match parse_os_string::<u64>(&value) {
                    Ok(millis) => config.reap_delay = Duration::from_millis(millis),
                    Err(()) => invalid(key, &value),
                },
                Config::DATA_ROOT if !value.is_empty() => config.data_root = value.into(),
                Config::VAR_ROOT if !value.is_empty() => config.var_root = value.into(),
                Config::CMD_LEVEL if !value.is_empty() => {
                    config.cmd_level = Some(value.to_string_lossy().into_owned())
                }
                _ => {}
            }
        }

        config.qmgr_name = match qmgr_name {
            Some(name) if !name.is_empty() => name,
            _ => hostname().map(|name| sanitise_qmgr_name(&name)).unwrap_or_default(),
        };
        config
    }

    /// Directory on the volume holding this queue manager's data.
    pub fn qmgr_data_root(&self) -> PathBuf {
        self.data_root.join(&self.qmgr_name)
    }

    /// Path of the system error log.
    pub fn system_error_log(&self) -> PathBuf {
        self.var_root.join("errors").join("AMQERR01.json")
    }

    /// Path of the queue manager's error log.
    pub fn qmgr_error_log(&self) -> PathBuf {
        self.var_root
            .join("qmgrs")
            .join(&self.qmgr_name)
            .join("errors")
            .join("AMQERR01.json")
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            qmgr_name: String::new(),
            license: None,
            log_format: LogFormat::Basic,
            debug: false,
            metrics: false,
            mirror_poll_interval: DEFAULT_POLL_INTERVAL,
            mirror_tag_source: false,
            shutdown_grace: Some(Duration::from_secs(30)),
            reap_delay: Duration::ZERO,
            data_root: PathBuf::from("/mnt/mqm"),
            var_root: PathBuf::from("/var/mqm"),
            cmd_level: None,
        }
    }
}

fn parse_log_format(value: &OsStr) -> Option<LogFormat> {
    match value.to_str() {
        Some("json") => Some(LogFormat::Json),
        Some("basic") | Some("") => Some(LogFormat::Basic),
        _ => None,
    }
}

fn is_true(value: &OsStr) -> bool {
    matches!(value.to_str(), Some("true") | Some("1"))
}

fn invalid(key: &str, value: &OsStr) {
    warn!(
        "{} environment variable is invalid, ignoring it: value={:?}",
        key, value
    );
}

/// Parse an `OsStr` as `T`.
fn parse_os_string<T>(str: &OsStr) -> Result<T, ()>
where
    T: FromStr,
{
    str.to_str().and_then(|s| s.parse().ok()).ok_or(())
}

/// Remove characters that are invalid in a queue manager name, limiting it to
/// 48 characters.
pub fn sanitise_qmgr_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '%'))
        .take(MAX_QMGR_NAME_LEN)
        .collect()
}

/// Returns the host name of the machine (container).
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is valid for `buf.len()` bytes.
    let res = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if res != 0 {
        warn!(
            "failed to get host name: {}",
            std::io::Error::last_os_error()
        );
        return None;
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..len]).into_owned())
}
