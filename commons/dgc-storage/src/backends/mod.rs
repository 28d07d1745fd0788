pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;
