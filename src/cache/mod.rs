pub mod durable;
pub mod memory;
pub mod store;

pub use durable::SqliteDurableCache;
pub use memory::CacheStats;
pub use store::{CacheOptions, CacheStore};
