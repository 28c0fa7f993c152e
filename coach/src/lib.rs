//! Writing Task 1 coaching: examiner feedback, regenerated visuals and the
//! asynchronous job flow behind the slow diagram pipeline.

pub mod batch;
pub mod chat;
pub mod content;
pub mod errors;
pub mod exec;
pub mod gallery;
pub mod jobs;
pub mod map_sketch;
pub mod micro;
pub mod review;
pub mod sanitize;
pub mod store;
pub mod task;

mod upstream;

pub use batch::BatchClient;
pub use chat::{OpenAiClient, OpenAiConfig};
pub use content::{ContentClient, ContentConfig};
pub use errors::{CoachError, Result};
pub use exec::{CodeRunner, ExecutionOutput, RemoteSandbox, RemoteSandboxConfig};
pub use gallery::{GalleryClient, GalleryConfig, GalleryListing};
pub use jobs::{Job, JobKind, JobOrchestrator, JobRequest, JobResult, JobStatus, JobStore};
pub use micro::{LocalSandbox, LocalSandboxConfig};
pub use review::{ReviewConfig, ReviewService, Visualization};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
pub use task::{Phase, RequestType, TaskRequest, TaskType};
