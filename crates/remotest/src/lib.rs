//! remotest: coordinator/worker protocol stack for remote test execution.
//!
//! A coordinator process decides which test units must run and consumes
//! their results; a worker process (possibly on another machine) executes
//! them. The two talk over a persistent TCP socket carrying length-prefixed
//! JSON action messages. This crate is the protocol stack: the reconnecting
//! transport, the action codec and dispatch layer, the coordinator-side
//! listener, the worker process supervisor, and the session orchestrator.

pub mod config;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod wire;
pub mod worker;

pub use config::{ConfigError, RunnerConfig, TransportConfig};
pub use orchestrator::{
    NullEventSink, Orchestrator, Reporter, SessionConfig, SessionError, SessionPhase,
    TestEventSink, TracingReporter,
};
pub use protocol::{
    CoordinatorAction, RunStats, TestCaseResult, TestCaseStatus, TestCaseSummary, TestFileResult,
    TestUnit, WorkerAction, WorkerActionHandler, WorkerActionKind, dispatch,
};
pub use server::{PeerId, PendingAction, Server, ServerConfig, ServerError};
pub use supervisor::{LinePrefixer, SpawnError, Supervisor};
pub use transport::{Transport, TransportError, TransportEvent};
pub use wire::codec::{ActionMessage, FrameCodec, ProtocolError};
pub use wire::fault::{Cause, Fault, Payload};
pub use worker::{ProgressSender, TestExecutor, Worker};
