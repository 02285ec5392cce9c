//! Domain model (ids, statuses, task/worker/HLS records, retry decisions, errors).

pub mod decision;
pub mod errors;
pub mod hls;
pub mod ids;
pub mod state;
pub mod task;
pub mod worker;

pub use decision::{Decider, Decision, DefaultDecider, RetryPolicy};
pub use errors::{ErrorKind, SchedulerError};
pub use hls::{
    HlsConfig, HlsFormat, HlsPlaylist, HlsSegment, PlaylistKind, Rendition, RenditionSpec,
    SubTaskRecord,
};
pub use ids::{SubTaskId, TaskId, WorkerId};
pub use state::{SubTaskStatus, TaskStatus, WorkerStatus};
pub use task::{EncodeConfig, NewTask, TaskRecord};
pub use worker::{LoadSnapshot, WorkerRecord};
