//! Worker-side client loop.
//!
//! Mirrors the coordinator's dispatch table from the connecting side: the
//! worker receives `initialize` and `run-tests`, drives a host-provided
//! executor, and streams per-unit progress actions back over the transport.
//! How a single test unit is executed locally is entirely the executor's
//! concern.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::protocol::{CoordinatorAction, TestCaseResult, TestFileResult, TestUnit, WorkerAction};
use crate::transport::{Transport, TransportError, TransportEvent};
use crate::wire::fault::{Fault, Payload};

/// Streams per-unit progress actions back to the coordinator while a batch
/// is executing.
#[derive(Clone, Copy)]
pub struct ProgressSender<'a> {
    transport: &'a Transport<WorkerAction, CoordinatorAction>,
}

impl ProgressSender<'_> {
    pub async fn test_file_start(&self, test: &TestUnit) -> Result<(), TransportError> {
        self.transport
            .send(WorkerAction::TestFileStart { test: test.clone() })
            .await
    }

    pub async fn test_file_failure(
        &self,
        test: &TestUnit,
        error: Fault,
    ) -> Result<(), TransportError> {
        self.transport
            .send(WorkerAction::TestFileFailure {
                test: test.clone(),
                error,
            })
            .await
    }

    pub async fn test_file_success(
        &self,
        test: &TestUnit,
        result: TestFileResult,
    ) -> Result<(), TransportError> {
        self.transport
            .send(WorkerAction::TestFileSuccess {
                test: test.clone(),
                result,
            })
            .await
    }

    pub async fn test_case_result(
        &self,
        test_path: impl Into<String>,
        result: TestCaseResult,
    ) -> Result<(), TransportError> {
        self.transport
            .send(WorkerAction::TestCaseResult {
                test_path: test_path.into(),
                result,
            })
            .await
    }
}

/// Host seam for the actual test execution.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Build the local runner from the coordinator's handshake payloads.
    async fn initialize(
        &self,
        global_config: Payload,
        run_context: Payload,
    ) -> Result<(), Fault>;

    /// Execute the batch, streaming per-unit progress as units settle.
    async fn run_tests(
        &self,
        tests: Vec<TestUnit>,
        progress: ProgressSender<'_>,
    ) -> Result<(), Fault>;
}

/// Worker process entry point: one transport, one executor, one session.
pub struct Worker<E> {
    transport: Transport<WorkerAction, CoordinatorAction>,
    executor: Arc<E>,
}

impl<E: TestExecutor> Worker<E> {
    pub fn new(config: TransportConfig, executor: E) -> Self {
        Self {
            transport: Transport::new(config),
            executor: Arc::new(executor),
        }
    }

    /// Connect and serve one session: initialize on handshake, execute on
    /// dispatch, report completion, then disconnect.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let Some(mut events) = self.transport.take_events() else {
            return Err(TransportError::Closed);
        };
        self.transport.connect().await?;

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => {
                    tracing::info!("connected to coordinator");
                }
                TransportEvent::Disconnected { reason } => {
                    // The transport reconnects on its own while the session
                    // is still live.
                    tracing::info!(?reason, "disconnected from coordinator");
                }
                TransportEvent::Message(CoordinatorAction::Initialize {
                    global_config,
                    run_context,
                }) => {
                    tracing::debug!("initializing local runner");
                    if let Err(fault) = self.executor.initialize(global_config, run_context).await
                    {
                        tracing::error!(%fault, "runner initialization failed");
                    }
                }
                TransportEvent::Message(CoordinatorAction::RunTests { tests }) => {
                    tracing::info!(count = tests.len(), "running test batch");
                    let progress = ProgressSender {
                        transport: &self.transport,
                    };
                    if let Err(fault) = self.executor.run_tests(tests, progress).await {
                        tracing::error!(%fault, "test batch failed");
                    }
                    self.transport.send(WorkerAction::RunTestsCompleted).await?;
                    self.transport.disconnect("test run completed").await;
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RunStats, WorkerActionHandler, WorkerActionKind};
    use crate::server::{Server, ServerConfig};
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn sample_result() -> TestFileResult {
        let now = Utc::now();
        TestFileResult {
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
            for test in &tests {
                progress
                    .test_file_start(test)
                    .await
                    .map_err(|e| Fault::new("TransportError", e.to_string()))?;
                progress
                    .test_file_success(test, sample_result())
                    .await
                    .map_err(|e| Fault::new("TransportError", e.to_string()))?;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: StdMutex<Vec<String>>,
    }

    impl WorkerActionHandler for Recording {
        fn on_run_tests_completed(&self) {
            self.calls.lock().unwrap().push("completed".into());
        }
        fn on_test_file_start(&self, test: &TestUnit) {
            self.calls.lock().unwrap().push(format!("start {}", test));
        }
        fn on_test_file_failure(&self, test: &TestUnit, error: &Fault) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("failure {} {}", test, error));
        }
        fn on_test_file_success(&self, test: &TestUnit, _result: &TestFileResult) {
            self.calls.lock().unwrap().push(format!("success {}", test));
        }
        fn on_test_case_result(&self, test_path: &str, _result: &TestCaseResult) {
            self.calls.lock().unwrap().push(format!("case {}", test_path));
        }
    }

    #[tokio::test]
    async fn worker_serves_one_session() {
        let recording = Arc::new(Recording::default());
        let mut server = Server::new(
            ServerConfig { port: 0 },
            Arc::clone(&recording) as Arc<dyn WorkerActionHandler>,
        );
        server.start().await.unwrap();
        let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

        let worker = Worker::new(
            TransportConfig::new(addr).with_reconnect_delay(Duration::from_millis(20)),
            StubExecutor,
        );
        let worker_task = tokio::spawn(worker.run());

        let peer = server.wait_for_client(Duration::from_secs(5)).await.unwrap();
        server
            .send(
                peer,
                CoordinatorAction::Initialize {
                    global_config: Payload::null(),
                    run_context: Payload::null(),
                },
            )
            .await
            .unwrap();
        let completion = server
            .subscribe_action(peer, WorkerActionKind::RunTestsCompleted)
            .unwrap();
        server
            .send(
                peer,
                CoordinatorAction::RunTests {
                    tests: vec![TestUnit::new("a.test.js"), TestUnit::new("b.test.js")],
                },
            )
            .await
            .unwrap();

        let completed = completion.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(completed.kind(), WorkerActionKind::RunTestsCompleted);

        worker_task.await.unwrap().unwrap();

        let calls = recording.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "start a.test.js",
                "success a.test.js",
                "start b.test.js",
                "success b.test.js",
                "completed",
            ]
        );

        server.stop().await.unwrap();
    }
}
