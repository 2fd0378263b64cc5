pub mod local_cache;

pub use local_cache::{CacheStats, LocalCache};
