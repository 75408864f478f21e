pub mod handle;
pub mod flags;
pub mod calls;
pub mod diagnostic;

pub use handle::{Handle, ObjectKind};
pub use calls::{Call, CallResult, Completion, RecordedCommand};
pub use diagnostic::{Diagnostic, ErrorKind, Severity};
