//! Tests for the supervisor's control loop that don't involve child processes
//! or process signals.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use qminit::mirror::{LineFormat, MirrorOptions, StartAt};
use qminit::{start_supervisor, ControlToken, ServiceStart, ShutdownReport, SupervisorOptions};

use crate::util::{append, assert_send, assert_sync, temp_file, Output};

fn options() -> SupervisorOptions {
    SupervisorOptions {
        shutdown_grace: Some(Duration::from_secs(5)),
    }
}

#[test]
fn controller_is_send_and_sync() {
    assert_send::<qminit::Controller>();
    assert_sync::<qminit::Controller>();
}

#[test]
fn terminate_token_stops_supervisor() {
    let handle = start_supervisor(options()).unwrap();
    let token = handle.cancel_token();
    assert!(!token.is_cancelled());
    handle.dispatch(ControlToken::Terminate).unwrap();
    let report = handle.await_shutdown().unwrap();
    assert_eq!(report, ShutdownReport::default());
    assert!(token.is_cancelled());
}

#[test]
fn dispatch_after_stop_fails() {
    let handle = start_supervisor(options()).unwrap();
    let controller = handle.controller();
    controller.dispatch(ControlToken::Terminate).unwrap();
    let _ = handle.await_shutdown().unwrap();

    let err = controller.dispatch(ControlToken::ReapOnce).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);
}

#[test]
fn tokens_after_terminate_are_ignored() {
    let handle = start_supervisor(options()).unwrap();
    handle.dispatch(ControlToken::Terminate).unwrap();
    // Either queued behind the terminate token, or rejected.
    let _ = handle.dispatch(ControlToken::BeginReaping);
    let _ = handle.dispatch(ControlToken::Terminate);
    let report = handle.await_shutdown().unwrap();
    assert_eq!(report, ShutdownReport::default());
}

#[test]
fn mirrors_are_stopped_on_terminate() {
    let handle = start_supervisor(options()).unwrap();
    let output = Output::new();
    for name in ["supervisor_mirror.1.log", "supervisor_mirror.2.log"] {
        let path = temp_file(name);
        append(&path, b"mirrored\n");
        let options = MirrorOptions {
            start_at: StartAt::Beginning,
            poll_interval: Duration::from_millis(10),
            tag: None,
            format: LineFormat::Raw,
        };
        handle
            .mirror(path, output.destination(name), options)
            .unwrap();
    }
    let completed = handle.completed_mirrors();

    handle.dispatch(ControlToken::Terminate).unwrap();
    let report = handle.await_shutdown().unwrap();
    assert_eq!(report.mirrors, 2);
    assert_eq!(report.stopped, 2);
    assert_eq!(completed.get(), 2);
    assert_eq!(output.contents(), b"mirrored\nmirrored\n");
}

#[test]
fn service_is_stopped_on_terminate() {
    let handle = start_supervisor(options()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    handle
        .set_service_stop(move || -> io::Result<()> {
            let _ = c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    handle.dispatch(ControlToken::Terminate).unwrap();
    let _ = handle.await_shutdown().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Service stop hook counting its calls.
fn counting_service(
    calls: &Arc<AtomicUsize>,
) -> impl FnMut() -> io::Result<()> + Clone + Send + 'static {
    let calls = calls.clone();
    move || {
        let _ = calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn start_service() {
    let handle = start_supervisor(options()).unwrap();
    let stops = Arc::new(AtomicUsize::new(0));
    let mut started = 0;
    let res = handle.start_service(counting_service(&stops), |_| {
        started += 1;
        Ok(())
    });
    assert_eq!(res.unwrap(), ServiceStart::Running);
    assert_eq!(started, 1);
    assert!(!handle.is_stopping());
    assert_eq!(stops.load(Ordering::SeqCst), 0);

    handle.dispatch(ControlToken::Terminate).unwrap();
    let _ = handle.await_shutdown().unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn terminate_while_starting_service_stops_it() {
    let handle = start_supervisor(options()).unwrap();
    let stops = Arc::new(AtomicUsize::new(0));
    let res = handle.start_service(counting_service(&stops), |_| {
        // Termination request arrives while the service is starting.
        handle.dispatch(ControlToken::Terminate)?;
        limited_loop! {
            if handle.is_stopping() {
                break;
            }
            sleep(Duration::from_millis(1));
        }
        Ok(())
    });
    assert_eq!(res.unwrap(), ServiceStart::Stopped);
    let _ = handle.await_shutdown().unwrap();
    // Once by the shutdown hook, which ran before the service was started,
    // and once after it was started.
    assert_eq!(stops.load(Ordering::SeqCst), 2);
}

#[test]
fn start_service_after_terminate() {
    let handle = start_supervisor(options()).unwrap();
    handle.dispatch(ControlToken::Terminate).unwrap();
    limited_loop! {
        if handle.is_stopping() {
            break;
        }
        sleep(Duration::from_millis(1));
    }

    let stops = Arc::new(AtomicUsize::new(0));
    let res = handle.start_service(counting_service(&stops), |_| {
        panic!("service mustn't be started after terminate")
    });
    assert_eq!(res.unwrap(), ServiceStart::Stopped);
    let _ = handle.await_shutdown().unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 0);
}
