pub mod memory;
pub mod binding;
pub mod command;
pub mod sync;
pub mod session;
pub mod report;
pub mod validator;

pub use report::{CollectingSink, DiagnosticSink, TracingSink, Verdict};
pub use validator::ValidationLayer;
