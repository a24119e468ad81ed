//! Mock build engine shared by the integration tests.
//!
//! Processes started in mock containers interpret their argument vector:
//! - `exit <code>`: print `bye` and exit with `code`
//! - anything else: echo stdin lines to stdout until a line `exit` or EOF

#![allow(dead_code)]

use async_trait::async_trait;
use kiln_core::engine::{
    BuildOutput, BuildRequest, Container, ContainerProcess, ContainerRequest, Definition, Engine,
    EngineResult, EngineSession, ExecMeta, ExecOp, Mount, MountType, NetMode, Op, ProcessIo,
    ProcessSpec, Reference, SolveRequest, SolveResponse, SolveResult, StepError, WinSize,
    IMAGE_CONFIG_KEY, IMAGE_DIGEST_KEY,
};
use kiln_core::ioset::{BoxReader, BoxWriter};
use kiln_core::status::{StatusEvent, StatusSender, VertexState};
use kiln_core::EngineError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

pub const IMAGE_CONFIG: &str = r#"{"architecture":"amd64","os":"linux","config":{
    "User":"app","Env":["PATH=/usr/bin","MODE=release"],"Cmd":["/bin/sh"],"WorkingDir":"/srv"}}"#;

/// Shared state observed by tests.
#[derive(Default)]
pub struct MockState {
    pub fail_step: Mutex<Option<StepError>>,
    pub build_error: Mutex<Option<String>>,
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub read_input_line: Mutex<bool>,
    pub build_inputs: Mutex<Vec<String>>,
    pub containers: Mutex<Vec<ContainerRequest>>,
    pub specs: Mutex<Vec<ProcessSpec>>,
    pub resizes: Mutex<Vec<WinSize>>,
    pub sessions_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub released: AtomicUsize,
    pub builds: AtomicUsize,
}

/// Mock engine (doesn't require an actual build daemon).
#[derive(Clone, Default)]
pub struct MockEngine {
    pub state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose builds fail at an exec step with two mounts.
    pub fn failing() -> Self {
        let engine = Self::new();
        *engine.state.fail_step.lock().unwrap() = Some(failed_exec_step());
        engine
    }

    /// Hold every build until the returned notifier fires.
    pub fn gated(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.state.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn containers(&self) -> Vec<ContainerRequest> {
        self.state.containers.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.state.specs.lock().unwrap().clone()
    }
}

pub fn failed_exec_step() -> StepError {
    StepError {
        op: Op::Exec(ExecOp {
            meta: ExecMeta {
                args: vec!["/bin/sh".into(), "-c".into(), "make check".into()],
                env: vec!["A=1".into(), "B=2".into()],
                cwd: "/src".into(),
                user: "builder".into(),
            },
            mounts: vec![
                Mount { dest: "/".into(), ..Default::default() },
                Mount { dest: "/cache".into(), mount_type: MountType::Cache, ..Default::default() },
            ],
            network: NetMode::None,
        }),
        input_ids: vec!["input-root".into(), "input-cache".into()],
        mount_ids: vec!["output-root".into(), "output-cache".into()],
        message: "process \"/bin/sh -c make check\" did not complete successfully: exit code: 2"
            .into(),
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn build(
        &self,
        _request: &BuildRequest,
        input: BoxReader,
        status: StatusSender,
    ) -> EngineResult<BuildOutput> {
        self.state.builds.fetch_add(1, Ordering::SeqCst);
        let _ = status
            .send(StatusEvent::new("sha256:step", "[1/1] RUN make check", VertexState::Started))
            .await;

        let read_line = *self.state.read_input_line.lock().unwrap();
        if read_line {
            let mut line = String::new();
            BufReader::new(input)
                .read_line(&mut line)
                .await
                .map_err(|e| EngineError::Other(e.into()))?;
            self.state.build_inputs.lock().unwrap().push(line);
        }

        let gate = self.state.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let build_error = self.state.build_error.lock().unwrap().clone();
        if let Some(message) = build_error {
            return Err(EngineError::Other(anyhow::anyhow!(message)));
        }

        let fail_step = self.state.fail_step.lock().unwrap().clone();
        if let Some(step) = fail_step {
            let _ = status.try_send(StatusEvent::new(
                "sha256:step",
                "[1/1] RUN make check",
                VertexState::Errored { message: step.message.clone() },
            ));
            return Err(EngineError::solve(step, Some(Definition::new("failing-step"))));
        }

        let _ = status.try_send(StatusEvent::new(
            "sha256:step",
            "[1/1] RUN make check",
            VertexState::Completed,
        ));
        Ok(BuildOutput {
            response: SolveResponse {
                exporter_response: HashMap::from([(
                    IMAGE_DIGEST_KEY.to_string(),
                    "sha256:0123".to_string(),
                )]),
            },
            definition: Definition::new("final"),
        })
    }

    async fn open_session(&self, _status: StatusSender) -> EngineResult<Arc<dyn EngineSession>> {
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession { state: Arc::clone(&self.state) }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineSession for MockSession {
    async fn solve(&self, request: SolveRequest) -> EngineResult<SolveResult> {
        if !request.evaluate {
            let reference = Reference { id: "resolved-root".into(), definition: request.definition };
            return Ok(SolveResult::with_reference(reference));
        }

        let fail_step = self.state.fail_step.lock().unwrap().clone();
        if let Some(step) = fail_step {
            return Err(EngineError::solve(step, Some(request.definition)));
        }

        let reference = Reference { id: "final-root".into(), definition: request.definition };
        Ok(SolveResult::with_reference(reference).with_metadata(IMAGE_CONFIG_KEY, IMAGE_CONFIG))
    }

    async fn new_container(&self, request: ContainerRequest) -> EngineResult<Box<dyn Container>> {
        self.state.containers.lock().unwrap().push(request);
        Ok(Box::new(MockContainer { state: Arc::clone(&self.state) }))
    }

    async fn close(&self) {
        self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockContainer {
    state: Arc<MockState>,
}

#[async_trait]
impl Container for MockContainer {
    async fn start(&self, spec: ProcessSpec, io: ProcessIo) -> EngineResult<Box<dyn ContainerProcess>> {
        self.state.specs.lock().unwrap().push(spec.clone());

        let (done_tx, done_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let killed = kill.clone();

        tokio::spawn(async move {
            let ProcessIo { stdin, stdout, stderr } = io;
            let code = tokio::select! {
                code = run_mock(spec.args, stdin, stdout, stderr) => code,
                _ = killed.cancelled() => 137,
            };
            let _ = done_tx.send(Some(code));
        });

        Ok(Box::new(MockProcess { done: done_rx, kill, state: Arc::clone(&self.state) }))
    }

    async fn release(&self) -> EngineResult<()> {
        self.state.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn run_mock(args: Vec<String>, stdin: BoxReader, mut stdout: BoxWriter, _stderr: BoxWriter) -> i32 {
    if let [cmd, code] = args.as_slice() {
        if cmd == "exit" {
            let _ = stdout.write_all(b"bye\n").await;
            return code.parse().unwrap_or(1);
        }
    }

    let mut lines = BufReader::new(stdin).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line == "exit" {
            return 0;
        }
        if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err() {
            return 1;
        }
    }
    0
}

struct MockProcess {
    done: watch::Receiver<Option<i32>>,
    kill: CancellationToken,
    state: Arc<MockState>,
}

#[async_trait]
impl ContainerProcess for MockProcess {
    async fn wait(&self) -> EngineResult<()> {
        let mut done = self.done.clone();
        let code = *done.wait_for(Option::is_some).await.map_err(|_| EngineError::SessionClosed)?;
        match code.unwrap_or(1) {
            0 => Ok(()),
            code => Err(EngineError::Exit { code }),
        }
    }

    async fn kill(&self) -> EngineResult<()> {
        self.kill.cancel();
        Ok(())
    }

    async fn resize(&self, size: WinSize) -> EngineResult<()> {
        self.state.resizes.lock().unwrap().push(size);
        Ok(())
    }
}

/// Read exactly `n` bytes or fail after a second.
pub async fn read_exactly(reader: &mut (impl AsyncRead + Unpin), n: usize) -> String {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(2), reader.read_exact(&mut buf))
        .await
        .expect("timed out reading output")
        .expect("read failed");
    String::from_utf8(buf).expect("utf8 output")
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
