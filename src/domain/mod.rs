//! Domain layer: entities, job model, errors.

pub mod entities;
pub mod errors;
pub mod job;

pub use entities::{
    sanitize_file_name, Chat, ChatKind, EntityKind, ItemError, ItemKey, MediaAccessRef, MediaItem,
    MediaRef, MediaStatus, MediaType, Message, MessageEntity,
};
pub use errors::{EngineError, GatewayError};
pub use job::{
    ChatTypeMask, ExportFilter, ExportJob, JobAggregates, JobState, MediaTypeMask, OutputFormat,
    OutputPolicy, PerformancePolicy, MAX_CONCURRENT_DOWNLOADS, MIN_CONCURRENT_DOWNLOADS,
};
