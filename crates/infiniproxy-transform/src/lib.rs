//! Pure mapping between the messages dialect and the chat/completions dialect.
//!
//! Nothing in this crate performs IO, retries or backend selection; malformed
//! optional input degrades to a safe default instead of failing.

pub mod config;
pub mod generate_content;

pub use config::TranslatorConfig;
