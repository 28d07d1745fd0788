pub mod any_store;
pub mod backends;
pub mod config;
pub mod document;
pub mod error;
pub mod traits;

pub use any_store::*;
pub use config::*;
pub use document::*;
pub use error::*;
pub use traits::*;

// Re-export backends for convenience
pub use backends::memory::MemoryDocStore;
#[cfg(feature = "redb")]
pub use backends::redb::RedbDocStore;
