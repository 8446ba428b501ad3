//! Session orchestration.
//!
//! Sequences one run: start server and worker concurrently, wait for the
//! worker to attach, handshake, dispatch the batch, await completion, tear
//! down. Any failure along the way still gets best-effort teardown of both
//! worker and server before it is surfaced to the embedding host.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RunnerConfig;
use crate::protocol::{
    CoordinatorAction, TestCaseResult, TestFileResult, TestUnit, WorkerActionHandler,
    WorkerActionKind,
};
use crate::server::{Server, ServerConfig, ServerError};
use crate::supervisor::{SpawnError, Supervisor};
use crate::wire::fault::{Fault, Payload};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// Orchestration step the reporter is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    ServerStarting,
    WorkerStarting,
    AwaitingPeer,
    Handshaking,
    Dispatching,
    AwaitingCompletion,
    TearingDown,
}

impl SessionPhase {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ServerStarting => "starting server",
            Self::WorkerStarting => "starting worker",
            Self::AwaitingPeer => "waiting for a worker to attach",
            Self::Handshaking => "initializing worker",
            Self::Dispatching => "dispatching tests",
            Self::AwaitingCompletion => "awaiting completion",
            Self::TearingDown => "tearing down",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Per-step progress surface for the embedding host: every step reports
/// starting, completed or failed, with the failure's message on failure.
pub trait Reporter: Send + Sync {
    fn step_started(&self, phase: SessionPhase);
    fn step_completed(&self, phase: SessionPhase);
    fn step_failed(&self, phase: SessionPhase, message: &str);
}

/// Reporter that logs through tracing.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn step_started(&self, phase: SessionPhase) {
        tracing::info!(step = %phase, "starting");
    }

    fn step_completed(&self, phase: SessionPhase) {
        tracing::info!(step = %phase, "completed");
    }

    fn step_failed(&self, phase: SessionPhase, message: &str) {
        tracing::error!(step = %phase, %message, "failed");
    }
}

/// Live test events re-emitted to the embedding host as they stream in.
pub trait TestEventSink: Send + Sync {
    fn test_file_start(&self, test: &TestUnit);
    fn test_file_failure(&self, test: &TestUnit, error: &Fault);
    fn test_file_success(&self, test: &TestUnit, result: &TestFileResult);
    fn test_case_result(&self, test_path: &str, result: &TestCaseResult);
}

/// Sink that discards every event.
pub struct NullEventSink;

impl TestEventSink for NullEventSink {
    fn test_file_start(&self, _test: &TestUnit) {}
    fn test_file_failure(&self, _test: &TestUnit, _error: &Fault) {}
    fn test_file_success(&self, _test: &TestUnit, _result: &TestFileResult) {}
    fn test_case_result(&self, _test_path: &str, _result: &TestCaseResult) {}
}

/// Bridges inbound worker actions to the host sink. Completion is not
/// forwarded; the orchestrator observes it through `wait_for_action`.
struct EventBridge {
    sink: Arc<dyn TestEventSink>,
}

impl WorkerActionHandler for EventBridge {
    fn on_run_tests_completed(&self) {}

    fn on_test_file_start(&self, test: &TestUnit) {
        self.sink.test_file_start(test);
    }

    fn on_test_file_failure(&self, test: &TestUnit, error: &Fault) {
        self.sink.test_file_failure(test, error);
    }

    fn on_test_file_success(&self, test: &TestUnit, result: &TestFileResult) {
        self.sink.test_file_success(test, result);
    }

    fn on_test_case_result(&self, test_path: &str, result: &TestCaseResult) {
        self.sink.test_case_result(test_path, result);
    }
}

/// Run-wide parameters of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Handshake payload: run-wide configuration.
    pub global_config: Payload,
    /// Handshake payload: run context.
    pub run_context: Payload,
    /// How long to wait for a worker to attach.
    pub peer_timeout: Duration,
    /// How long to wait for the batch to complete.
    pub completion_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            global_config: Payload::null(),
            run_context: Payload::null(),
            peer_timeout: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(3600),
        }
    }
}

impl SessionConfig {
    pub fn with_global_config(mut self, payload: Payload) -> Self {
        self.global_config = payload;
        self
    }

    pub fn with_run_context(mut self, payload: Payload) -> Self {
        self.run_context = payload;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }
}

/// Top-level coordinator entry point. Each `run_session` call creates a
/// fresh session; sessions are never restarted.
pub struct Orchestrator {
    runner: RunnerConfig,
    session: SessionConfig,
    reporter: Arc<dyn Reporter>,
    sink: Arc<dyn TestEventSink>,
}

impl Orchestrator {
    pub fn new(runner: RunnerConfig) -> Self {
        Self {
            runner,
            session: SessionConfig::default(),
            reporter: Arc::new(TracingReporter),
            sink: Arc::new(NullEventSink),
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn TestEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run the batch to completion on a remote worker.
    pub async fn run_session(&self, tests: Vec<TestUnit>) -> Result<(), SessionError> {
        let session = Session::new(
            &self.runner,
            self.session.clone(),
            Arc::clone(&self.reporter),
            Arc::clone(&self.sink),
        );
        session.run(tests).await
    }
}

/// One orchestrated run attempt. Consumed by `run`: a session cannot be
/// restarted, only re-created.
struct Session {
    server: Server,
    supervisor: Supervisor,
    config: SessionConfig,
    reporter: Arc<dyn Reporter>,
    completed: bool,
}

impl Session {
    fn new(
        runner: &RunnerConfig,
        config: SessionConfig,
        reporter: Arc<dyn Reporter>,
        sink: Arc<dyn TestEventSink>,
    ) -> Self {
        Self {
            server: Server::new(
                ServerConfig { port: runner.port },
                Arc::new(EventBridge { sink }),
            ),
            supervisor: Supervisor::new(&runner.command, &runner.log_prefix),
            config,
            reporter,
            completed: false,
        }
    }

    async fn run(mut self, tests: Vec<TestUnit>) -> Result<(), SessionError> {
        let reporter = Arc::clone(&self.reporter);

        let startup = {
            let server = &mut self.server;
            let supervisor = &mut self.supervisor;
            tokio::try_join!(
                report_step(reporter.as_ref(), SessionPhase::ServerStarting, async {
                    server.start().await
                }),
                report_step(reporter.as_ref(), SessionPhase::WorkerStarting, async {
                    supervisor.start().await
                }),
            )
        };
        if let Err(error) = startup {
            let _ = self.teardown().await;
            return Err(error);
        }

        let outcome = self.drive(&tests).await;
        if outcome.is_ok() {
            self.completed = true;
        }
        tracing::debug!(completed = self.completed, "session finished, tearing down");
        let teardown = self.teardown().await;
        outcome?;
        teardown
    }

    async fn drive(&self, tests: &[TestUnit]) -> Result<(), SessionError> {
        let reporter = self.reporter.as_ref();

        report_step(reporter, SessionPhase::AwaitingPeer, async {
            self.server.wait_for_client(self.config.peer_timeout).await
        })
        .await?;

        report_step(reporter, SessionPhase::Handshaking, async {
            for peer in self.server.peers() {
                self.server
                    .send(
                        peer,
                        CoordinatorAction::Initialize {
                            global_config: self.config.global_config.clone(),
                            run_context: self.config.run_context.clone(),
                        },
                    )
                    .await?;
            }
            Ok::<(), ServerError>(())
        })
        .await?;

        // Every attached peer receives the identical full batch; this stack
        // is single-peer, multiple peers are not sharded. The completion
        // subscription is installed before the batch is sent so a worker
        // that finishes immediately cannot slip past the wait.
        let mut completions = Vec::new();
        report_step(reporter, SessionPhase::Dispatching, async {
            for peer in self.server.peers() {
                completions
                    .push(self.server.subscribe_action(peer, WorkerActionKind::RunTestsCompleted)?);
                self.server
                    .send(
                        peer,
                        CoordinatorAction::RunTests {
                            tests: tests.to_vec(),
                        },
                    )
                    .await?;
            }
            Ok::<(), ServerError>(())
        })
        .await?;

        report_step(reporter, SessionPhase::AwaitingCompletion, async {
            for pending in completions {
                pending.wait(self.config.completion_timeout).await?;
            }
            Ok::<(), ServerError>(())
        })
        .await?;

        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), SessionError> {
        let reporter = Arc::clone(&self.reporter);
        let supervisor = &mut self.supervisor;
        let server = &mut self.server;
        report_step(reporter.as_ref(), SessionPhase::TearingDown, async {
            // Both stops run even if the first fails.
            let worker = supervisor.stop().await;
            let listener = server.stop().await;
            worker?;
            listener?;
            Ok::<(), SessionError>(())
        })
        .await
    }
}

async fn report_step<T, E: Into<SessionError>>(
    reporter: &dyn Reporter,
    phase: SessionPhase,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, SessionError> {
    reporter.step_started(phase);
    match fut.await {
        Ok(value) => {
            reporter.step_completed(phase);
            Ok(value)
        }
        Err(error) => {
            let error = error.into();
            reporter.step_failed(phase, &error.to_string());
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::protocol::RunStats;
    use crate::worker::{ProgressSender, TestExecutor, Worker};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[derive(Default)]
    struct RecordingReporter {
        steps: StdMutex<Vec<String>>,
    }

    impl RecordingReporter {
        fn steps(&self) -> Vec<String> {
            self.steps.lock().unwrap().clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn step_started(&self, phase: SessionPhase) {
            self.steps.lock().unwrap().push(format!("started {:?}", phase));
        }
        fn step_completed(&self, phase: SessionPhase) {
            self.steps
                .lock()
                .unwrap()
                .push(format!("completed {:?}", phase));
        }
        fn step_failed(&self, phase: SessionPhase, message: &str) {
            self.steps
                .lock()
                .unwrap()
                .push(format!("failed {:?}: {}", phase, message));
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TestEventSink for RecordingSink {
        fn test_file_start(&self, test: &TestUnit) {
            self.events.lock().unwrap().push(format!("start {}", test));
        }
        fn test_file_failure(&self, test: &TestUnit, error: &Fault) {
            self.events
                .lock()
                .unwrap()
                .push(format!("failure {} {}", test, error));
        }
        fn test_file_success(&self, test: &TestUnit, _result: &TestFileResult) {
            self.events.lock().unwrap().push(format!("success {}", test));
        }
        fn test_case_result(&self, test_path: &str, _result: &TestCaseResult) {
            self.events.lock().unwrap().push(format!("case {}", test_path));
        }
    }

    struct StubExecutor;

    #[async_trait]
    impl TestExecutor for StubExecutor {
        async fn initialize(
            &self,
            _global_config: Payload,
            _run_context: Payload,
        ) -> Result<(), Fault> {
            Ok(())
        }

        async fn run_tests(
            &self,
            tests: Vec<TestUnit>,
            progress: ProgressSender<'_>,
        ) -> Result<(), Fault> {
            let now = Utc::now();
            let result = TestFileResult {
                stats: RunStats {
                    failures: 0,
                    passes: 1,
                    pending: 0,
                    todo: 0,
                    start: now,
                    end: now,
                },
                skipped: false,
                error_message: None,
                tests: vec![],
            };
            for test in &tests {
                progress
                    .test_file_start(test)
                    .await
                    .map_err(|e| Fault::new("TransportError", e.to_string()))?;
                progress
                    .test_file_success(test, result.clone())
                    .await
                    .map_err(|e| Fault::new("TransportError", e.to_string()))?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_session_runs_to_completion() {
        init_tracing();
        let port = free_port();
        let runner = RunnerConfig {
            command: "sleep 30".to_string(),
            port,
            log_prefix: "worker".to_string(),
        };
        let reporter = Arc::new(RecordingReporter::default());
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(runner)
            .with_session(
                SessionConfig::default()
                    .with_peer_timeout(Duration::from_secs(10))
                    .with_completion_timeout(Duration::from_secs(10)),
            )
            .with_reporter(Arc::clone(&reporter) as Arc<dyn Reporter>)
            .with_event_sink(Arc::clone(&sink) as Arc<dyn TestEventSink>);

        // In-process worker standing in for the remote peer; the transport
        // keeps retrying until the session's server is listening.
        let worker = Worker::new(
            TransportConfig::new(format!("127.0.0.1:{}", port))
                .with_reconnect_delay(Duration::from_millis(20)),
            StubExecutor,
        );
        let worker_task = tokio::spawn(worker.run());

        orchestrator
            .run_session(vec![TestUnit::new("a.test.js"), TestUnit::new("b.test.js")])
            .await
            .unwrap();
        worker_task.await.unwrap().unwrap();

        assert_eq!(
            sink.events(),
            vec![
                "start a.test.js",
                "success a.test.js",
                "start b.test.js",
                "success b.test.js",
            ]
        );

        let steps = reporter.steps();
        assert!(!steps.iter().any(|step| step.starts_with("failed")));
        for phase in [
            SessionPhase::ServerStarting,
            SessionPhase::WorkerStarting,
            SessionPhase::AwaitingPeer,
            SessionPhase::Handshaking,
            SessionPhase::Dispatching,
            SessionPhase::AwaitingCompletion,
            SessionPhase::TearingDown,
        ] {
            assert!(steps.contains(&format!("completed {:?}", phase)), "{:?}", steps);
        }
        assert_eq!(steps.last().unwrap().as_str(), "completed TearingDown");
    }

    #[tokio::test]
    async fn missing_peer_fails_but_still_tears_down() {
        let runner = RunnerConfig {
            command: "sleep 30".to_string(),
            port: free_port(),
            log_prefix: "worker".to_string(),
        };
        let reporter = Arc::new(RecordingReporter::default());
        let orchestrator = Orchestrator::new(runner)
            .with_session(
                SessionConfig::default().with_peer_timeout(Duration::from_millis(100)),
            )
            .with_reporter(Arc::clone(&reporter) as Arc<dyn Reporter>);

        let result = orchestrator.run_session(vec![TestUnit::new("a.test.js")]).await;
        match result {
            Err(SessionError::Server(ServerError::Timeout { .. })) => {}
            other => panic!("expected peer timeout, got {:?}", other),
        }

        let steps = reporter.steps();
        assert!(
            steps
                .iter()
                .any(|step| step.starts_with("failed AwaitingPeer")),
            "{:?}",
            steps
        );
        assert_eq!(steps.last().unwrap().as_str(), "completed TearingDown");
    }

    #[test]
    fn phases_describe_themselves() {
        assert_eq!(SessionPhase::AwaitingPeer.to_string(), "waiting for a worker to attach");
        assert_eq!(SessionPhase::TearingDown.to_string(), "tearing down");
    }
}
