//! Result Uploader
//!
//! Delivers the results of terminal jobs to the router at least once.
//! Tasks live in the store until acknowledged, so a restart resumes them.

pub mod sink;
pub mod uploader;

pub use sink::{LogSink, ResultSink, RouterSink, UploadError};
pub use uploader::{UploadSettings, Uploader, UploaderHandle};
