pub mod entities;
pub mod seaorm;

pub use seaorm::{BackendInput, IssuedApiKey, SeaOrmStorage, StorageError, StorageResult};
