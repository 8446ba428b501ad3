//! Action messages exchanged between coordinator and worker.
//!
//! Each direction is a closed enum: the set of actions one side may receive
//! is fixed at compile time, and an exhaustive match guarantees exactly one
//! handler per action. On the wire every message is a single JSON object
//! tagged with its action name, e.g.
//! `{"action":"test-file-start","test":{"path":"a.test.js"}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wire::codec::ActionMessage;
use crate::wire::fault::{Fault, Payload};

/// One test unit the coordinator wants executed remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestUnit {
    pub path: String,
}

impl TestUnit {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl std::fmt::Display for TestUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

/// Aggregate counters for one executed test file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub failures: u32,
    pub passes: u32,
    pub pending: u32,
    pub todo: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Per-case summary inside a file result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseSummary {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_path: Option<String>,
}

/// Result of executing one test file on the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFileResult {
    pub stats: RunStats,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub tests: Vec<TestCaseSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseStatus {
    Passed,
    Failed,
    Pending,
    Todo,
}

/// Live result for a single test case, streamed as it settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub title: String,
    pub status: TestCaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_messages: Vec<String>,
}

/// Actions the coordinator sends to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum CoordinatorAction {
    /// Run-wide handshake, sent once per session before any work.
    Initialize {
        global_config: Payload,
        run_context: Payload,
    },

    /// The full ordered batch of test units for this session.
    RunTests { tests: Vec<TestUnit> },
}

/// Actions the worker streams back to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WorkerAction {
    /// Every unit in the batch has been executed.
    RunTestsCompleted,

    TestFileStart {
        test: TestUnit,
    },

    TestFileFailure {
        test: TestUnit,
        error: Fault,
    },

    TestFileSuccess {
        test: TestUnit,
        result: TestFileResult,
    },

    TestCaseResult {
        test_path: String,
        result: TestCaseResult,
    },
}

impl ActionMessage for CoordinatorAction {
    const ACTIONS: &'static [&'static str] = &["initialize", "run-tests"];

    fn action(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::RunTests { .. } => "run-tests",
        }
    }
}

impl ActionMessage for WorkerAction {
    const ACTIONS: &'static [&'static str] = &[
        "run-tests-completed",
        "test-file-start",
        "test-file-failure",
        "test-file-success",
        "test-case-result",
    ];

    fn action(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Kind discriminant for [`WorkerAction`], used to key completion waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerActionKind {
    RunTestsCompleted,
    TestFileStart,
    TestFileFailure,
    TestFileSuccess,
    TestCaseResult,
}

impl WorkerActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunTestsCompleted => "run-tests-completed",
            Self::TestFileStart => "test-file-start",
            Self::TestFileFailure => "test-file-failure",
            Self::TestFileSuccess => "test-file-success",
            Self::TestCaseResult => "test-case-result",
        }
    }
}

impl std::fmt::Display for WorkerActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkerAction {
    pub fn kind(&self) -> WorkerActionKind {
        match self {
            Self::RunTestsCompleted => WorkerActionKind::RunTestsCompleted,
            Self::TestFileStart { .. } => WorkerActionKind::TestFileStart,
            Self::TestFileFailure { .. } => WorkerActionKind::TestFileFailure,
            Self::TestFileSuccess { .. } => WorkerActionKind::TestFileSuccess,
            Self::TestCaseResult { .. } => WorkerActionKind::TestCaseResult,
        }
    }
}

/// Handler seam for worker-to-coordinator actions, one method per action.
pub trait WorkerActionHandler: Send + Sync {
    fn on_run_tests_completed(&self);
    fn on_test_file_start(&self, test: &TestUnit);
    fn on_test_file_failure(&self, test: &TestUnit, error: &Fault);
    fn on_test_file_success(&self, test: &TestUnit, result: &TestFileResult);
    fn on_test_case_result(&self, test_path: &str, result: &TestCaseResult);
}

/// Invoke the handler method matching the action. The match is exhaustive:
/// adding an action without a handler method fails to compile.
pub fn dispatch(handler: &dyn WorkerActionHandler, action: &WorkerAction) {
    match action {
        WorkerAction::RunTestsCompleted => handler.on_run_tests_completed(),
        WorkerAction::TestFileStart { test } => handler.on_test_file_start(test),
        WorkerAction::TestFileFailure { test, error } => {
            handler.on_test_file_failure(test, error)
        }
        WorkerAction::TestFileSuccess { test, result } => {
            handler.on_test_file_success(test, result)
        }
        WorkerAction::TestCaseResult { test_path, result } => {
            handler.on_test_case_result(test_path, result)
        }
    }
}
