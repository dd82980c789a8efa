pub mod config;
pub mod docker;
pub mod error;
pub mod logging;
pub mod pipeline;

pub use error::{PipelineError, Result};
