//! Tests for the shutdown coordinator.

use std::fs;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qminit::mirror::{self, LineFormat, MirrorOptions, StartAt};
use qminit::shutdown::{ShutdownCoordinator, ShutdownReport};

use crate::util::{append, temp_dir, temp_file, Blocking, Output};

fn options() -> MirrorOptions {
    MirrorOptions {
        start_at: StartAt::Beginning,
        poll_interval: Duration::from_millis(10),
        tag: None,
        format: LineFormat::Raw,
    }
}

#[test]
fn shutdown_stops_all_mirrors() {
    let mut coordinator = ShutdownCoordinator::new(Some(Duration::from_secs(5)));
    let completed = coordinator.completed();
    let output = Output::new();
    for name in ["shutdown_all.1.log", "shutdown_all.2.log"] {
        let path = temp_file(name);
        append(&path, b"line\n");
        let task = mirror::start(
            path,
            output.destination(name),
            coordinator.cancel_token(),
            options(),
        )
        .unwrap();
        coordinator.register(task);
    }
    assert_eq!(coordinator.outstanding(), 2);
    assert_eq!(completed.get(), 0);

    let report = coordinator.shutdown();
    let expected = ShutdownReport {
        mirrors: 2,
        stopped: 2,
        failed: 0,
        unacknowledged: 0,
    };
    assert_eq!(report, expected);
    assert_eq!(completed.get(), 2);
    assert_eq!(coordinator.outstanding(), 0);
    assert_eq!(output.contents(), b"line\nline\n");
}

#[test]
fn shutdown_is_idempotent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut coordinator = ShutdownCoordinator::new(None);
    let c = calls.clone();
    coordinator.set_service_stop(Box::new(move || -> io::Result<()> {
        let _ = c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let path = temp_file("shutdown_idempotent.log");
    let output = Output::new();
    let task = mirror::start(
        path,
        output.destination("test"),
        coordinator.cancel_token(),
        options(),
    )
    .unwrap();
    coordinator.register(task);

    let first = coordinator.shutdown();
    let second = coordinator.shutdown();
    assert_eq!(first, second);
    assert_eq!(first.stopped, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.completed().get(), 1);
}

#[test]
fn unresponsive_mirror_is_bounded_by_grace() {
    let mut coordinator = ShutdownCoordinator::new(Some(Duration::from_millis(50)));
    let path = temp_file("shutdown_unresponsive.log");
    append(&path, b"stuck\n");
    let blocking = Blocking::new();
    let task = mirror::start(
        path,
        blocking.destination(),
        coordinator.cancel_token(),
        options(),
    )
    .unwrap();
    coordinator.register(task);

    let report = coordinator.shutdown();
    assert_eq!(report.mirrors, 1);
    assert_eq!(report.unacknowledged, 1);
    assert_eq!(coordinator.completed().get(), 0);
    assert_eq!(coordinator.outstanding(), 1);
    blocking.release();
}

#[test]
fn failed_mirror_still_completes() {
    let mut coordinator = ShutdownCoordinator::new(Some(Duration::from_secs(5)));
    let path = temp_dir("shutdown_failed_source");
    fs::create_dir_all(&path).unwrap();
    let output = Output::new();
    let task = mirror::start(
        path,
        output.destination("test"),
        coordinator.cancel_token(),
        options(),
    )
    .unwrap();
    coordinator.register(task);

    let report = coordinator.shutdown();
    assert_eq!(report.failed, 1);
    assert_eq!(report.stopped, 0);
    assert_eq!(coordinator.completed().get(), 1);
}

#[test]
fn register_after_shutdown_stops_immediately() {
    let mut coordinator = ShutdownCoordinator::new(Some(Duration::from_secs(5)));
    let _ = coordinator.shutdown();

    let path = temp_file("shutdown_late_register.log");
    append(&path, b"late\n");
    let output = Output::new();
    let token = coordinator.cancel_token();
    assert!(token.is_cancelled());
    let task = mirror::start(path, output.destination("test"), token, options()).unwrap();
    coordinator.register(task);

    assert_eq!(coordinator.completed().get(), 1);
    assert_eq!(coordinator.outstanding(), 0);
    // Final pass still copies what was there.
    assert_eq!(output.contents(), b"late\n");
}
