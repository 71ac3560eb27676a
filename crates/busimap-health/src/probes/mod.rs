//! Concrete probes for the services the platform depends on.

pub mod cache;
pub mod datastore;
pub mod search;

pub use cache::CacheProbe;
pub use datastore::DatastoreProbe;
pub use search::SearchProbe;
