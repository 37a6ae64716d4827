//! Wire types for the two chat-completion dialects the gateway speaks.
//!
//! `claude` is the inbound "messages" format (wire format A), `openai` is the
//! backend "chat/completions" format (wire format B). Types here only describe
//! shapes; all mapping between them lives in `infiniproxy-transform`.

pub mod claude;
pub mod openai;
pub mod sse;
