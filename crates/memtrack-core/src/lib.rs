pub mod config;
pub mod error;
pub mod registry;

pub use config::MemtrackConfig;
pub use error::{CoreError, TrackError};
pub use registry::HandleRegistry;
