//! In-process queue broker: named queues with concurrency caps,
//! token-bucket rate limits, and delayed redelivery for retries.

mod broker;
mod control;

pub use broker::{retry_delay, Broker, JobHandler, QueueConfig};
pub use control::{JobContext, JobControl, JobHandle, NoopProgress, ProgressSink};

/// Queue names the workers consume.
pub mod queues {
    pub const SITEMAP_SCANNER: &str = "sitemap-scanner";
    pub const GOOGLE_SUBMITTER: &str = "google-submitter";
    pub const INDEXNOW_SUBMITTER: &str = "indexnow-submitter";
}
