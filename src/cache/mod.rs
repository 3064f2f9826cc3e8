pub mod key;
pub mod map;
pub mod cleanup;

pub use key::{CacheKey, SubcorpusHash};
pub use map::{CacheEntry, ConcCacheMap, Registration};
pub use cleanup::{CacheCleaner, CleanupReport};
