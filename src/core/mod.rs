pub mod agent;
pub mod controller;
pub mod delivery;
pub mod models;
pub mod node;
pub mod queue;
pub mod report;

pub use agent::{AgentError, BoardRunner, NodeAgent};
pub use controller::{BoardRun, TestController, TestCase, create_controller};
pub use delivery::{ReportSink, create_sink};
pub use models::{Job, JobHandle, JobResult, JobState, NodeStatus, Operation, RunTestsArgs};
pub use node::node_status;
pub use queue::{JobQueue, QueueError};
pub use report::{BoardOutcome, BoardReport, Conclusion, Outcome, ReportAssembler};
