mod client;
mod protocol;

pub use client::{DaemonClient, IpcError};
pub use protocol::{
    ClientRequest, ErrorCode, RawWorkerMessage, RequestEnvelope, Response, ResponseStatus,
    SessionSummary, StartSessionConfig, TargetSummary, WorkerCommand, WorkerCommandEnvelope,
    WorkerMessage, WorkerReady, WorkerReply, command_name, forward_to_worker, new_request_id,
    to_line,
};
