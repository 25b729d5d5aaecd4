pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod postgres;
pub mod replicator;
pub mod sink;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use replicator::Replicator;
