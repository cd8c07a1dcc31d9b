//! Remote log pipeline: a verbosity-gated record buffer and the uploader that
//! drains it in size-bounded batches over the device's telemetry channel.

pub mod buffer;
pub mod level;
pub mod remote;
pub mod uploader;

pub use buffer::{LogBatch, LogBuffer};
pub use level::Verbosity;
pub use remote::RemoteLog;
pub use uploader::{CycleOutcome, LogUploader, UploaderConfig};
