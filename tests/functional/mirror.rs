//! Tests for the log mirror workers.

use std::fs;
use std::thread::sleep;
use std::time::{Duration, Instant};

use qminit::cancel;
use qminit::mirror::{self, LineFormat, MirrorExit, MirrorOptions, StartAt, StopError};

use crate::util::{append, temp_dir, temp_file, Blocking, Output};

const POLL: Duration = Duration::from_millis(10);
const TIMEOUT: Duration = Duration::from_secs(5);

fn options(start_at: StartAt) -> MirrorOptions {
    MirrorOptions {
        start_at,
        poll_interval: POLL,
        tag: None,
        format: LineFormat::Raw,
    }
}

fn deadline() -> Option<Instant> {
    Some(Instant::now() + TIMEOUT)
}

#[test]
fn lines_written_before_cancel_are_mirrored() {
    let path = temp_file("mirror_before_cancel.log");
    append(&path, b"A\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path.clone(),
        output.destination("test"),
        token,
        options(StartAt::Beginning),
    )
    .unwrap();
    assert_eq!(task.source(), path);
    assert_eq!(task.destination(), "test");

    append(&path, b"B\n");
    let exit = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(exit, MirrorExit::Cancelled { copied: 4 });
    assert_eq!(output.contents(), b"A\nB\n");
}

#[test]
fn start_at_end_skips_existing_lines() {
    let path = temp_file("mirror_start_at_end.log");
    append(&path, b"old\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path.clone(),
        output.destination("test"),
        token,
        options(StartAt::End),
    )
    .unwrap();

    // Give the worker time to open the file before appending.
    sleep(POLL * 5);
    append(&path, b"new\n");
    limited_loop! {
        if output.len() == 4 {
            break;
        }
        sleep(POLL);
    }
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(output.contents(), b"new\n");
}

#[test]
fn waits_for_source_to_be_created() {
    let path = temp_file("mirror_created_later.log");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path.clone(),
        output.destination("test"),
        token,
        options(StartAt::End),
    )
    .unwrap();

    sleep(POLL * 5);
    assert!(!task.is_finished());
    append(&path, b"hello\n");
    limited_loop! {
        if output.len() == 6 {
            break;
        }
        sleep(POLL);
    }
    let exit = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(exit, MirrorExit::Cancelled { copied: 6 });
    assert_eq!(output.contents(), b"hello\n");
}

#[test]
fn cancelled_before_source_exists() {
    let path = temp_file("mirror_never_created.log");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path,
        output.destination("test"),
        token,
        options(StartAt::Beginning),
    )
    .unwrap();

    let exit = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(exit, MirrorExit::Cancelled { copied: 0 });
    assert!(output.contents().is_empty());
}

#[test]
fn unreadable_source_fails() {
    let path = temp_dir("mirror_directory_source");
    fs::create_dir_all(&path).unwrap();
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path,
        output.destination("test"),
        token,
        options(StartAt::Beginning),
    )
    .unwrap();

    // Fails without being cancelled.
    limited_loop! {
        if task.is_finished() {
            break;
        }
        sleep(POLL);
    }
    let exit = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(exit, MirrorExit::Failed);
}

#[test]
fn stop_is_acknowledged_promptly() {
    let path = temp_file("mirror_prompt_stop.log");
    append(&path, b"line\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let options = MirrorOptions {
        start_at: StartAt::Beginning,
        // Cancellation mustn't wait for the next poll.
        poll_interval: Duration::from_secs(60),
        tag: None,
        format: LineFormat::Raw,
    };
    let task = mirror::start(path, output.destination("test"), token, options).unwrap();

    sleep(POLL * 2);
    let start = Instant::now();
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(output.contents(), b"line\n");
}

#[test]
fn partial_line_written_on_final_pass() {
    let path = temp_file("mirror_partial_line.log");
    append(&path, b"complete\nno newline");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path,
        output.destination("test"),
        token,
        options(StartAt::Beginning),
    )
    .unwrap();

    limited_loop! {
        if output.len() == 9 {
            break;
        }
        sleep(POLL);
    }
    // Partial line is held back while running.
    assert_eq!(output.contents(), b"complete\n");
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(output.contents(), b"complete\nno newline");
}

#[test]
fn tagged_lines() {
    let path = temp_file("mirror_tagged.log");
    append(&path, b"one\ntwo\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let options = MirrorOptions {
        tag: Some("qmgr".to_owned()),
        ..options(StartAt::Beginning)
    };
    let task = mirror::start(path, output.destination("test"), token, options).unwrap();
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(output.contents(), b"[qmgr] one\n[qmgr] two\n");
}

#[test]
fn follows_rotation() {
    let path = temp_file("mirror_rotation.log");
    let rotated = temp_file("mirror_rotation.log.1");
    append(&path, b"a\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path.clone(),
        output.destination("test"),
        token,
        options(StartAt::Beginning),
    )
    .unwrap();

    limited_loop! {
        if output.len() == 2 {
            break;
        }
        sleep(POLL);
    }
    fs::rename(&path, &rotated).unwrap();
    append(&path, b"b\n");
    limited_loop! {
        if output.len() == 4 {
            break;
        }
        sleep(POLL);
    }
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(output.contents(), b"a\nb\n");
}

#[test]
fn follows_truncation() {
    let path = temp_file("mirror_truncation.log");
    append(&path, b"first line\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path.clone(),
        output.destination("test"),
        token,
        options(StartAt::Beginning),
    )
    .unwrap();

    limited_loop! {
        if output.len() == 11 {
            break;
        }
        sleep(POLL);
    }
    fs::write(&path, b"x\n").unwrap();
    limited_loop! {
        if output.len() == 13 {
            break;
        }
        sleep(POLL);
    }
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(output.contents(), b"first line\nx\n");
}

#[test]
fn stop_times_out() {
    let path = temp_file("mirror_stop_timeout.log");
    append(&path, b"stuck\n");
    let blocking = Blocking::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path,
        blocking.destination(),
        token,
        options(StartAt::Beginning),
    )
    .unwrap();

    let err = task
        .stop(&cancel, Some(Instant::now() + POLL * 5))
        .unwrap_err();
    assert_eq!(err, StopError::Timeout);
    assert!(cancel.is_cancelled());
    // Let the detached worker finish.
    blocking.release();
}

/// Options that won't poll again during a test, so only the final pass can
/// pick up any changes.
fn slow_options() -> MirrorOptions {
    MirrorOptions {
        poll_interval: Duration::from_secs(60),
        ..options(StartAt::Beginning)
    }
}

#[test]
fn final_pass_follows_rotation() {
    let path = temp_file("mirror_final_rotation.log");
    let rotated = temp_file("mirror_final_rotation.log.1");
    append(&path, b"a\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path.clone(),
        output.destination("test"),
        token,
        slow_options(),
    )
    .unwrap();

    limited_loop! {
        if output.len() == 2 {
            break;
        }
        sleep(POLL);
    }
    fs::rename(&path, &rotated).unwrap();
    append(&path, b"b\n");
    let exit = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(output.contents(), b"a\nb\n");
    assert_eq!(exit, MirrorExit::Cancelled { copied: 4 });
}

#[test]
fn final_pass_follows_truncation() {
    let path = temp_file("mirror_final_truncation.log");
    append(&path, b"first line\n");
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let task = mirror::start(
        path.clone(),
        output.destination("test"),
        token,
        slow_options(),
    )
    .unwrap();

    limited_loop! {
        if output.len() == 11 {
            break;
        }
        sleep(POLL);
    }
    fs::write(&path, b"x\n").unwrap();
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(output.contents(), b"first line\nx\n");
}

#[test]
fn simple_format() {
    let path = temp_file("mirror_simple_format.log");
    append(
        &path,
        br#"{"ibm_datetime":"2019-01-02T03:04:05.000Z","message":"AMQ5026I: The listener 'SYSTEM.LISTENER.TCP.1' has started."}
"#,
    );
    let output = Output::new();
    let (cancel, token) = cancel::new();
    let options = MirrorOptions {
        format: LineFormat::Simple,
        ..options(StartAt::Beginning)
    };
    let task = mirror::start(path, output.destination("test"), token, options).unwrap();
    let _ = task.stop(&cancel, deadline()).unwrap();
    assert_eq!(
        output.contents(),
        b"2019-01-02T03:04:05.000Z AMQ5026I: The listener 'SYSTEM.LISTENER.TCP.1' has started.\n"
    );
}
