//! Persistence collaborator, rate-limited HTTP fetch and bounded caching.

mod cache;
mod http;
mod memory;
mod postgres;
mod store;

pub use cache::TtlCache;
pub use http::{FetchError, HttpClientConfig, HttpFetcher, SimpleTokenBucket, TokenBucketConfig};
pub use memory::MemoryVenueStore;
pub use postgres::PgVenueStore;
pub use store::{SlugLookup, StoreError, VenueStore};
