pub mod policy;
pub mod source_context;

pub use policy::{ErrorPolicy, RetryPolicy};
pub use source_context::{RetryDecision, SourceContext};
