//! Batches of real commands through the local execution path.

use std::process::Command;
use std::time::{Duration, Instant};

use mupdate::batch::{
    run_batch, run_batch_or_exit, Batch, BatchShape, WorkItem, EXIT_WORKER_FAILED,
};
use mupdate::executor::CommandResult;
use mupdate::interrupt::Interrupt;
use mupdate::lock::{run_with_lock_at, LockHandle};
use mupdate::ssh::{ssh_node_tracked, RemoteCommand};
use mupdate::ErrorCode;

fn have_toolchain() -> bool {
    ["xxd", "bash", "timeout"].iter().all(|program| {
        Command::new("sh")
            .arg("-c")
            .arg(format!("command -v {}", program))
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    })
}

fn host_item(host: &str, command: &str) -> WorkItem<CommandResult> {
    let spec = RemoteCommand::new(host, command).timeout(Duration::from_secs(10));
    WorkItem::new(move |ctx, _| ssh_node_tracked(&spec, Some(ctx.tracker()))).key(host)
}

#[test]
fn keyed_commands_on_loopback_hosts() {
    if !have_toolchain() {
        return;
    }
    let items = vec![
        host_item("127.0.0.1", "echo one"),
        host_item("127.0.0.2", "echo two >&2; exit 3"),
        host_item("localhost", "printf three"),
    ];

    let results = Batch::new(2)
        .interrupt(Interrupt::manual())
        .keyed()
        .run(items)
        .unwrap()
        .into_keyed()
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results["127.0.0.1"].stdout, "one\n");
    assert_eq!(results["127.0.0.2"].stderr, "two");
    assert_eq!(results["127.0.0.2"].exit_code, 3);
    assert_eq!(results["localhost"].stdout, "three");
}

#[test]
fn batch_timeout_is_per_command() {
    if !have_toolchain() {
        return;
    }
    let slow = RemoteCommand::new("127.0.0.1", "sleep 5").timeout(Duration::from_secs(1));
    let items = vec![WorkItem::new(move |ctx, _| ssh_node_tracked(&slow, Some(ctx.tracker())))];

    let started = Instant::now();
    let results = run_batch(items, 1, BatchShape::Sequence)
        .unwrap()
        .into_sequence()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_ne!(results[0].exit_code, 0);
}

#[test]
fn locked_batch_runs_once_per_holder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mupdate_exec.lock");
    let held = LockHandle::try_acquire(&path).unwrap().unwrap();

    let skipped = run_with_lock_at(&path, "exec", || {
        Batch::new(1)
            .interrupt(Interrupt::manual())
            .run(vec![WorkItem::new(|_, _| Ok(1))])
    })
    .unwrap();
    assert!(skipped.is_none());

    drop(held);
    let ran = run_with_lock_at(&path, "exec", || {
        Batch::new(1)
            .interrupt(Interrupt::manual())
            .run(vec![WorkItem::new(|_, _| Ok(1))])
    })
    .unwrap();
    assert!(ran.is_some());
}

#[test]
fn worker_error_fails_whole_batch() {
    let items = vec![
        WorkItem::new(|_, _| Ok(1)),
        WorkItem::new(|_, _| Err(mupdate::Error::internal_unexpected("bad host"))),
        WorkItem::new(|_, _| Ok(3)),
    ];
    let err = Batch::new(3)
        .interrupt(Interrupt::manual())
        .run(items)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BatchWorkerFailed);
}

const EXIT_CHILD_ENV: &str = "MUPDATE_BATCH_EXIT_CHILD";

#[test]
fn worker_fault_exits_process_with_42() {
    if std::env::var_os(EXIT_CHILD_ENV).is_some() {
        let items = vec![
            WorkItem::new(|_, _| Ok(1)),
            WorkItem::new(|_, _| Err(mupdate::Error::internal_unexpected("bad host"))),
        ];
        let results = run_batch_or_exit(items, 2, BatchShape::Sequence);
        println!("partial results: {:?}", results.ok().and_then(|r| r.into_sequence()));
        return;
    }

    // Re-run this test alone in a child process, which the fault must end.
    let output = Command::new(std::env::current_exe().unwrap())
        .args([
            "worker_fault_exits_process_with_42",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(EXIT_CHILD_ENV, "1")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(EXIT_WORKER_FAILED));
    assert!(!String::from_utf8_lossy(&output.stdout).contains("partial results"));
}
