pub mod error;
pub mod memory;
pub mod traits;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use error::*;
pub use memory::MemoryCoordinator;
pub use traits::*;

#[cfg(feature = "etcd")]
pub use etcd::{EtcdCoordFactory, EtcdCoordinator, EtcdCredentials};
