pub mod response_cache;
pub mod turbo;

pub use response_cache::{CacheEntry, ResponseCache};
pub use turbo::{CacheState, TurboCaching};
