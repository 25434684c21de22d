//! Isolated execution: wire protocol, channels, worker runtime, scheduler.

pub mod channel;
pub mod interp;
pub mod protocol;
pub mod scheduler;
pub mod worker;

pub use channel::{ChannelError, WorkerChannel};
pub use interp::{Interpreter, Trap};
pub use protocol::{JobKind, PROTOCOL_VERSION, ProtocolError, WireMessage};
pub use scheduler::{Completion, Evaluation, EvaluationTask, ExecutionScheduler, SchedulerError};
pub use worker::{MEMORY_EXIT_CODE, WorkerError};
