//! Integration tests for the build controller.
//!
//! These tests drive the full path: build -> result session -> interactive
//! process -> IO forwarding, against a mock engine.

mod common;

use common::{eventually, read_exactly, MockEngine};
use kiln_core::engine::{BuildRequest, MountType, NetMode, WinSize};
use kiln_core::ioset::{pipe, IoSet};
use kiln_core::status;
use kiln_core::{BuildController, InvokeConfig, KilnError, ProcessStatus};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

fn controller(engine: &MockEngine) -> Arc<BuildController> {
    Arc::new(BuildController::new(Arc::new(engine.clone())))
}

async fn build(controller: &BuildController) -> kiln_core::BuildOutcome {
    controller
        .build(&BuildRequest::default(), Box::new(tokio::io::empty()), None, &CancellationToken::new())
        .await
        .expect("build should produce an outcome")
}

fn exit_with(code: i32) -> InvokeConfig {
    InvokeConfig::default().with_cmd(["exit".to_string(), code.to_string()])
}

#[tokio::test]
async fn test_concurrent_builds_are_exclusive() {
    let engine = MockEngine::new();
    let gate = engine.gated();
    let controller = controller(&engine);

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { build(&controller).await })
    };
    let ctl = &*controller;
    eventually(move || async move { ctl.is_building() }).await;

    let second = controller
        .build(&BuildRequest::default(), Box::new(tokio::io::empty()), None, &CancellationToken::new())
        .await;
    assert!(matches!(second, Err(KilnError::BuildOngoing)));

    gate.notify_one();
    let outcome = first.await.unwrap();
    assert!(!outcome.is_failed());
    assert_eq!(outcome.reference, "local");
    assert!(!controller.is_building());
    assert_eq!(engine.state.builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_step_is_captured() {
    let engine = MockEngine::failing();
    let controller = controller(&engine);

    let outcome = build(&controller).await;
    assert!(outcome.is_failed());
    assert!(outcome.response.is_none());

    let session = controller.result_session().await.unwrap();
    assert!(!session.is_success());
    assert_eq!(session.step_error(), outcome.failure.as_ref());
    controller.close().await;
}

#[tokio::test]
async fn test_failed_step_mounts_output_or_input_snapshots() {
    let engine = MockEngine::failing();
    let controller = controller(&engine);
    build(&controller).await;

    let cancel = CancellationToken::new();
    controller.invoke("local", "after", &exit_with(0), IoSet::empty(), &cancel).await.unwrap();
    controller.invoke("local", "before", &exit_with(0).initial(), IoSet::empty(), &cancel).await.unwrap();

    let containers = engine.containers();
    assert_eq!(containers.len(), 2);

    let after: Vec<_> = containers[0].mounts.iter().map(|m| m.reference_id.as_str()).collect();
    assert_eq!(after, vec!["output-root", "output-cache"]);
    let before: Vec<_> = containers[1].mounts.iter().map(|m| m.reference_id.as_str()).collect();
    assert_eq!(before, vec!["input-root", "input-cache"]);

    assert_eq!(containers[0].network, NetMode::None);
    assert_eq!(containers[0].mounts[1].mount_type, MountType::Cache);
    controller.close().await;
}

#[tokio::test]
async fn test_failed_step_process_defaults() {
    let engine = MockEngine::failing();
    let controller = controller(&engine);
    build(&controller).await;

    let config = exit_with(0).with_env("B=9");
    controller.invoke("local", "p", &config, IoSet::empty(), &CancellationToken::new()).await.unwrap();

    let spec = engine.specs().pop().unwrap();
    assert_eq!(spec.args, vec!["exit", "0"]);
    assert_eq!(spec.env_value("A"), Some("1"));
    assert_eq!(spec.env_value("B"), Some("9"));
    assert_eq!(spec.user.as_deref(), Some("builder"));
    assert_eq!(spec.cwd.as_deref(), Some("/src"));
    controller.close().await;
}

#[tokio::test]
async fn test_initial_on_success_is_rejected() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let config = InvokeConfig::default().initial();
    let err = controller
        .invoke("local", "p", &config, IoSet::empty(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::InitialStateOnSuccess));
    assert!(controller.list_processes("local").await.unwrap().is_empty());
    assert!(engine.containers().is_empty());
    controller.close().await;
}

#[tokio::test]
async fn test_success_uses_image_config() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let config = InvokeConfig::default().with_cmd(["exit", "0"]).with_env("MODE=debug");
    controller.invoke("local", "p", &config, IoSet::empty(), &CancellationToken::new()).await.unwrap();

    let container = engine.containers().pop().unwrap();
    assert_eq!(container.mounts.len(), 1);
    assert_eq!(container.mounts[0].dest, "/");
    assert_eq!(container.mounts[0].reference_id, "resolved-root");

    let spec = engine.specs().pop().unwrap();
    assert_eq!(spec.args, vec!["exit", "0"]);
    assert_eq!(spec.env_value("MODE"), Some("debug"));
    assert_eq!(spec.user.as_deref(), Some("app"));
    assert_eq!(spec.cwd.as_deref(), Some("/srv"));
    controller.close().await;
}

#[tokio::test]
async fn test_process_exit_code_is_reported() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let (out_w, mut out_r) = pipe(1024);
    let io = IoSet { stdin: None, stdout: Some(Box::new(out_w)), stderr: None };
    let err = controller
        .invoke("local", "p", &exit_with(3), io, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::ProcessFailed { ref pid, .. } if pid == "p"));
    assert_eq!(read_exactly(&mut out_r, 4).await, "bye\n");

    let listed = controller.list_processes("local").await.unwrap();
    assert!(matches!(listed[0].status, ProcessStatus::Failed { .. }));
    controller.close().await;
}

#[tokio::test]
async fn test_attach_to_finished_process_releases_stdin() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let cancel = CancellationToken::new();
    controller.invoke("local", "p", &exit_with(0), IoSet::empty(), &cancel).await.unwrap();

    let (mut stdin_w, stdin_r) = pipe(1024);
    let io = IoSet { stdin: Some(Box::new(stdin_r)), stdout: None, stderr: None };
    controller.invoke("local", "p", &exit_with(0), io, &cancel).await.unwrap();

    // Nothing keeps reading caller input for a finished process.
    assert!(stdin_w.write_all(b"ignored\n").await.is_err());
    controller.close().await;
}

#[tokio::test]
async fn test_two_processes_delete_one() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    for pid in ["p1", "p2"] {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        let (stdin_w, stdin_r) = pipe(1024);
        tasks.push((
            stdin_w,
            tokio::spawn(async move {
                let io = IoSet { stdin: Some(Box::new(stdin_r)), stdout: None, stderr: None };
                controller.invoke("local", pid, &InvokeConfig::default(), io, &cancel).await
            }),
        ));
    }

    let ctl = &*controller;
    eventually(move || async move { ctl.list_processes("local").await.unwrap().len() == 2 }).await;
    let pids: Vec<_> =
        controller.list_processes("local").await.unwrap().into_iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec!["p1", "p2"]);

    controller.disconnect_process("local", "p1").await.unwrap();
    let remaining = controller.list_processes("local").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].pid, "p2");
    assert_eq!(remaining[0].status, ProcessStatus::Running);

    let err = controller.disconnect_process("local", "p1").await.unwrap_err();
    assert!(matches!(err, KilnError::UnknownProcess { .. }));

    cancel.cancel();
    for (_stdin, task) in tasks {
        assert!(task.await.unwrap().is_err());
    }
    controller.close().await;
}

#[tokio::test]
async fn test_duplicate_pid_reattaches() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let (first_in_w, first_in_r) = pipe(1024);
    let (first_out_w, _first_out_r) = pipe(1024);
    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let io = IoSet {
                stdin: Some(Box::new(first_in_r)),
                stdout: Some(Box::new(first_out_w)),
                stderr: None,
            };
            controller
                .invoke("local", "shell", &InvokeConfig::default(), io, &CancellationToken::new())
                .await
        })
    };
    let ctl = &*controller;
    eventually(move || async move {
        ctl.list_processes("local").await.unwrap().first().is_some_and(|p| p.attached)
    })
    .await;

    let (mut second_in_w, second_in_r) = pipe(1024);
    let (second_out_w, mut second_out_r) = pipe(1024);
    let second = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let io = IoSet {
                stdin: Some(Box::new(second_in_r)),
                stdout: Some(Box::new(second_out_w)),
                stderr: None,
            };
            controller
                .invoke("local", "shell", &InvokeConfig::default(), io, &CancellationToken::new())
                .await
        })
    };

    let first_result = tokio::time::timeout(Duration::from_secs(2), first).await.unwrap().unwrap();
    assert!(matches!(first_result, Err(KilnError::IoCancelled)));

    second_in_w.write_all(b"hello\n").await.unwrap();
    assert_eq!(read_exactly(&mut second_out_r, 6).await, "hello\n");

    second_in_w.write_all(b"exit\n").await.unwrap();
    let second_result = tokio::time::timeout(Duration::from_secs(2), second).await.unwrap().unwrap();
    assert!(second_result.is_ok());

    // Only one container was ever created for the shared pid.
    assert_eq!(engine.containers().len(), 1);
    drop(first_in_w);
    controller.close().await;
}

#[tokio::test]
async fn test_cancel_detaches_but_process_keeps_running() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let (_stdin_w, stdin_r) = pipe(1024);
    let cancel = CancellationToken::new();
    let task = {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let io = IoSet { stdin: Some(Box::new(stdin_r)), stdout: None, stderr: None };
            controller.invoke("local", "shell", &InvokeConfig::default(), io, &cancel).await
        })
    };
    let ctl = &*controller;
    eventually(move || async move { !ctl.list_processes("local").await.unwrap().is_empty() })
        .await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(KilnError::Cancelled)));

    let listed = controller.list_processes("local").await.unwrap();
    assert_eq!(listed[0].status, ProcessStatus::Running);
    assert!(!listed[0].attached);
    controller.close().await;
}

#[tokio::test]
async fn test_stdin_eof_revokes_attachment() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let (stdin_w, stdin_r) = pipe(1024);
    let task = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let io = IoSet { stdin: Some(Box::new(stdin_r)), stdout: None, stderr: None };
            controller
                .invoke("local", "shell", &InvokeConfig::default(), io, &CancellationToken::new())
                .await
        })
    };
    let ctl = &*controller;
    eventually(move || async move { !ctl.list_processes("local").await.unwrap().is_empty() })
        .await;

    drop(stdin_w);
    let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(KilnError::IoCancelled)));
    controller.close().await;
}

#[tokio::test]
async fn test_resize_reaches_engine() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let session = controller.result_session().await.unwrap();
    let manager = kiln_core::ProcessManager::new();
    let process =
        manager.start_process("tty", Some(session), &InvokeConfig::default()).await.unwrap();
    process.resize(WinSize { rows: 50, cols: 200 }).await.unwrap();
    assert_eq!(*engine.state.resizes.lock().unwrap(), vec![WinSize { rows: 50, cols: 200 }]);

    let no_tty = InvokeConfig { tty: false, ..Default::default() };
    let session = controller.result_session().await.unwrap();
    let plain = manager.start_process("plain", Some(session), &no_tty).await.unwrap();
    plain.resize(WinSize::default()).await.unwrap();
    assert_eq!(engine.state.resizes.lock().unwrap().len(), 1);

    manager.cancel_running_processes().await;
    controller.close().await;
}

#[tokio::test]
async fn test_stale_identifiers() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    let cancel = CancellationToken::new();

    let err = controller
        .invoke("local", "p", &InvokeConfig::default(), IoSet::empty(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::NoBuildResult));

    let err = controller
        .invoke("remote", "p", &InvokeConfig::default(), IoSet::empty(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::UnknownRef { ref reference } if reference == "remote"));
    assert!(controller.list_processes("remote").await.is_err());

    assert_eq!(controller.list(), vec!["local"]);
    controller.close().await;
    controller.disconnect("local").await.unwrap();
}

#[tokio::test]
async fn test_kill_keeps_session() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let session = controller.result_session().await.unwrap();
    let (_stdin_w, stdin_r) = pipe(1024);
    let task = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let io = IoSet { stdin: Some(Box::new(stdin_r)), stdout: None, stderr: None };
            controller
                .invoke("local", "shell", &InvokeConfig::default(), io, &CancellationToken::new())
                .await
        })
    };
    let ctl = &*controller;
    eventually(move || async move { !ctl.list_processes("local").await.unwrap().is_empty() })
        .await;

    controller.kill().await;
    let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(controller.list_processes("local").await.unwrap().is_empty());
    assert!(!session.is_closed());

    // The id is free again and the session still serves new processes.
    controller
        .invoke("local", "shell", &exit_with(0), IoSet::empty(), &CancellationToken::new())
        .await
        .unwrap();
    controller.close().await;
}

#[tokio::test]
async fn test_close_releases_everything_once() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    for pid in ["a", "b"] {
        controller
            .invoke("local", pid, &exit_with(0), IoSet::empty(), &CancellationToken::new())
            .await
            .unwrap();
    }
    let session = controller.result_session().await.unwrap();

    controller.close().await;
    controller.close().await;
    session.close().await;

    assert!(session.is_closed());
    assert!(controller.result_session().await.is_none());
    assert_eq!(engine.state.released.load(Ordering::SeqCst), 2);
    assert_eq!(engine.state.sessions_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rebuild_replaces_session() {
    let engine = MockEngine::new();
    let controller = controller(&engine);

    build(&controller).await;
    let first = controller.result_session().await.unwrap();
    build(&controller).await;
    let second = controller.result_session().await.unwrap();

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(engine.state.sessions_opened.load(Ordering::SeqCst), 2);
    controller.close().await;
}

#[tokio::test]
async fn test_rebuild_frees_process_ids() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    build(&controller).await;

    let (_stdin_w, stdin_r) = pipe(1024);
    let cancel = CancellationToken::new();
    let task = {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let io = IoSet { stdin: Some(Box::new(stdin_r)), stdout: None, stderr: None };
            controller.invoke("local", "p1", &InvokeConfig::default(), io, &cancel).await
        })
    };
    let ctl = &*controller;
    eventually(move || async move { !ctl.list_processes("local").await.unwrap().is_empty() })
        .await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(KilnError::Cancelled)));

    build(&controller).await;
    assert!(controller.list_processes("local").await.unwrap().is_empty());

    controller
        .invoke("local", "p1", &exit_with(0), IoSet::empty(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(engine.containers().len(), 2);
    let listed = controller.list_processes("local").await.unwrap();
    assert_eq!(listed[0].status, ProcessStatus::Succeeded);
    controller.close().await;
}

#[tokio::test]
async fn test_engine_error_propagates_and_clears_flag() {
    let engine = MockEngine::new();
    *engine.state.build_error.lock().unwrap() = Some("frontend crashed".to_string());
    let controller = controller(&engine);

    let err = controller
        .build(&BuildRequest::default(), Box::new(tokio::io::empty()), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Engine(_)));
    assert_eq!(err.to_string(), "frontend crashed");
    assert!(!controller.is_building());
    assert!(controller.result_session().await.is_none());

    *engine.state.build_error.lock().unwrap() = None;
    assert!(!build(&controller).await.is_failed());
    controller.close().await;
}

#[tokio::test]
async fn test_build_cancelled() {
    let engine = MockEngine::new();
    let _gate = engine.gated();
    let controller = controller(&engine);
    let cancel = CancellationToken::new();

    let task = {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            controller
                .build(&BuildRequest::default(), Box::new(tokio::io::empty()), None, &cancel)
                .await
        })
    };
    let ctl = &*controller;
    eventually(move || async move { ctl.is_building() }).await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(KilnError::Cancelled)));
    assert!(!controller.is_building());
}

#[tokio::test]
async fn test_progress_is_forwarded() {
    let engine = MockEngine::new();
    let controller = controller(&engine);
    let (progress_tx, mut progress_rx) = status::channel(16);

    controller
        .build(
            &BuildRequest::default(),
            Box::new(tokio::io::empty()),
            Some(progress_tx),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), progress_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.vertex, "sha256:step");
    controller.close().await;
}
