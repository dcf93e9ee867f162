// Cache module for response caching.
// Context-scoped keys, the store contract, and in-memory and on-disk stores.

pub mod disk;
pub mod key;
pub mod memory;
pub mod paths;
pub mod store;

pub use disk::DiskStore;
pub use key::{ContextField, QueryParams, RequestContext, RequestKey};
pub use memory::MemoryStore;
pub use store::{CacheEntry, CacheStore, DEFAULT_TTL, is_under_prefix};
