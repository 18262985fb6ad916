//! The scan engine
//!
//! Everything with real concurrency lives here: the port-keyed rendezvous
//! matcher pairing streams with circuits, the worker set running one probe
//! per built circuit, the completion channel the workers report on, the
//! shared statistics, and the decider that shuts the whole scan down once
//! every circuit and worker is accounted for.

mod attacher;
mod dispatcher;
mod reader;
mod stats;
mod worker;

pub use attacher::{Attacher, PendingHalf, PrepareOutcome};
pub use dispatcher::EventHandler;
pub use reader::run_completion_reader;
pub use stats::{ScanStats, StatsSnapshot};
pub use worker::{
    completion_channel, CompletionReceiver, CompletionSender, ProbeContext, WorkerMessage,
    WorkerSet,
};
