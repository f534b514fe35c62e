//! Metadata caching: the shared stat cache, per-directory type caches and
//! the bucket decorator tying the stat cache to remote calls.

pub mod caching;
pub mod stat_cache;
pub mod type_cache;

pub use caching::FastStatBucket;
pub use stat_cache::{CacheLookup, SharedStatCache, StatCacheBucketView};
pub use type_cache::{EntryType, TypeCache, TypeCacheRegistry};
