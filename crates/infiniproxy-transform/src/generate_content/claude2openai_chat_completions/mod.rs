//! Caller speaks messages, backend speaks chat/completions.

pub mod request;
pub mod response;
pub mod stream;

pub use request::{transform_request, transform_tools};
pub use response::{map_finish_reason, transform_response};
pub use stream::OpenAIToClaudeStreamState;
