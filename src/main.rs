use std::path::Path;
use std::process::ExitCode;
use std::{fs, io, thread};

use clap::Parser;
use qminit::config::{Config, LogFormat};
use qminit::log::{debug, error, info, warn};
use qminit::mirror::{Destination, LineFormat, MirrorOptions, StartAt};
use qminit::provision::{self, MQM_USER};
use qminit::service::{self, License, QueueManager, Readiness, READY_FILE, TERMINATION_LOG};
use qminit::{
    identity, instance, start_supervisor, ControlToken, Error, ServiceStart, SupervisorHandle,
    SupervisorOptions,
};

/// Init process (PID 1) for a queue manager container.
///
/// Creates and starts the queue manager, mirrors its error logs to standard
/// out and reaps orphaned processes until a termination signal is received.
#[derive(Parser, Debug)]
#[command(name = "qminit", version, about)]
struct Cli {
    /// Initialise the volume only, then exit
    #[arg(short, long)]
    init: bool,

    /// Display debug info, then exit
    #[arg(long)]
    info: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (log_format, debug) = Config::log_settings(std::env::vars_os());
    qminit::log::init(log_format, debug);
    let config = Config::from_env();

    if cli.info {
        log_info(&config);
        return ExitCode::SUCCESS;
    }

    // Not writing a termination log, the other instance owns it.
    if let Err(err) = instance::verify_single_instance() {
        error!("{}", err);
        return ExitCode::FAILURE;
    }

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            service::write_termination_log(Path::new(TERMINATION_LOG), &err.to_string());
            ExitCode::FAILURE
        }
    }
}

fn log_info(config: &Config) {
    info!(
        "version: name={}, version={}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    info!("configuration: {:?}", config);
}

fn run(cli: &Cli, config: &Config) -> Result<(), Error> {
    if config.qmgr_name.is_empty() {
        return Err(Error::setup("unable to determine queue manager name"));
    }
    let ready = Readiness::new(READY_FILE);
    ready.clear().map_err(Error::setup)?;

    match License::check(config.license.as_deref()) {
        License::Accepted => {}
        License::View => {
            info!("set the LICENSE environment variable to `accept` to accept the license");
            return Err(Error::setup("license not accepted"));
        }
        License::NotAccepted => return Err(Error::setup("license not accepted")),
    }
    info!("using queue manager name: {}", config.qmgr_name);

    // Start handling signals before creating any process.
    let handle = start_supervisor(SupervisorOptions {
        shutdown_grace: config.shutdown_grace,
    })?;

    match setup(cli, config, &handle) {
        Ok(Setup::Running) => {}
        Ok(Setup::Initialised) => return stop(handle),
        Ok(Setup::Terminated) => {
            info!("terminated while setting up the queue manager");
            return stop(handle);
        }
        Err(err) => {
            // Still stop the log mirrors before exiting.
            if let Err(stop_err) = stop(handle) {
                warn!("failed to stop supervisor: {}", stop_err);
            }
            return Err(err);
        }
    }

    // Start reaping only after all commands we waited on have finished, then
    // reap whatever terminated in the meantime.
    if !config.reap_delay.is_zero() {
        debug!("delaying reaping: delay={:?}", config.reap_delay);
        thread::sleep(config.reap_delay);
    }
    let started = handle
        .dispatch(ControlToken::BeginReaping)
        .and_then(|()| handle.dispatch(ControlToken::ReapOnce));
    match started {
        Ok(()) => {}
        Err(ref err) if supervisor_stopped(err) => {
            info!("terminated while setting up the queue manager");
            return stop(handle);
        }
        Err(err) => return Err(Error::setup(err)),
    }
    if let Err(err) = ready.set() {
        if let Err(stop_err) = stop(handle) {
            warn!("failed to stop supervisor: {}", stop_err);
        }
        return Err(Error::setup(err));
    }

    let report = handle.await_shutdown()?;
    info!("stopped: {}", report);
    Ok(())
}

/// Result of [`setup`].
enum Setup {
    /// Queue manager is running.
    Running,
    /// Only initialised the volume.
    Initialised,
    /// Supervisor received a termination request before setup completed.
    Terminated,
}

/// Returns `true` if `err` means the supervisor is already stopped.
fn supervisor_stopped(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotConnected
}

/// Provision the volume, create and start the queue manager.
fn setup(cli: &Cli, config: &Config, handle: &SupervisorHandle) -> Result<Setup, Error> {
    let data_root = config.qmgr_data_root();
    let empty_volume = match fs::metadata(&data_root) {
        Ok(..) => false,
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => return Err(Error::setup(err)),
    };

    let resolver = identity::platform();
    let owner = resolver.lookup_user(MQM_USER).map_err(Error::setup)?;
    let qm = QueueManager::new(&config.qmgr_name, &data_root);
    for dir in [data_root.as_path(), qm.log_dir(), qm.data_dir()] {
        provision::ensure_directory(dir, owner, resolver).map_err(Error::setup)?;
    }
    service::create_dir_structure().map_err(Error::setup)?;

    // The default `mqs.ini` lives next to the installation, the queue
    // manager's copy lives on the volume.
    let default_ini = config.var_root.join("mqs.ini");
    if empty_volume {
        let _ = provision::copy_file(&default_ini, qm.mqs_ini()).map_err(Error::setup)?;
    }
    match fs::remove_file(&default_ini) {
        Ok(()) => {}
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(Error::setup(err)),
    }

    if cli.init {
        info!("initialised volume: path={}", data_root.display());
        return Ok(Setup::Initialised);
    }
    log_info(config);

    let created = qm.create().map_err(Error::setup)?;
    let start_at = if created {
        StartAt::Beginning
    } else {
        StartAt::End
    };
    let format = match config.log_format {
        LogFormat::Basic => LineFormat::Simple,
        LogFormat::Json => LineFormat::Raw,
    };
    let sources = [
        (config.system_error_log(), "system"),
        (config.qmgr_error_log(), "qmgr"),
    ];
    for (source, tag) in sources {
        let options = MirrorOptions {
            start_at,
            poll_interval: config.mirror_poll_interval,
            tag: config.mirror_tag_source.then(|| tag.to_owned()),
            format,
        };
        match handle.mirror(source, Destination::stdout(), options) {
            Ok(()) => {}
            Err(ref err) if supervisor_stopped(err) => return Ok(Setup::Terminated),
            Err(err) => return Err(Error::setup(err)),
        }
    }

    if let Some(level) = &config.cmd_level {
        qm.update_command_level(level).map_err(Error::setup)?;
    }
    let started = handle.start_service(qm.clone(), |qm| qm.start().map_err(io::Error::from));
    match started.map_err(Error::setup)? {
        ServiceStart::Running => {}
        ServiceStart::Stopped => return Ok(Setup::Terminated),
    }
    qm.configure().map_err(Error::setup)?;
    if config.metrics {
        warn!("metrics collection is not supported, ignoring MQ_ENABLE_METRICS");
    } else {
        info!("metrics are disabled");
    }

    Ok(Setup::Running)
}

/// Ask the supervisor to stop and wait for it.
fn stop(handle: SupervisorHandle) -> Result<(), Error> {
    if let Err(err) = handle.dispatch(ControlToken::Terminate) {
        debug!("supervisor already stopped: {}", err);
    }
    let report = handle.await_shutdown()?;
    info!("stopped: {}", report);
    Ok(())
}
