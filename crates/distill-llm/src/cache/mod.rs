//! Context cache lifecycle
//!
//! - [`CacheStore`]: durable key → handle map, read at startup
//! - [`CacheManager`]: single-flight get-or-create of remote cached contexts

pub mod manager;
pub mod store;

pub use manager::{cache_key, CacheManager, CacheRequest, CachedContext};
pub use store::CacheStore;
