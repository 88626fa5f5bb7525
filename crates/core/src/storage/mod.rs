//! Cache store collaborators.
//!
//! The dependency index never holds page bytes; they live behind
//! [`CacheStorage`]. Deleting an absent entry is a no-op.

use async_trait::async_trait;

use crate::Error;
use crate::model::SiteUri;

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn get(&self, site_uri: &SiteUri) -> Result<Option<String>, Error>;

    /// Store output, replacing any previous value.
    async fn set(&self, site_uri: &SiteUri, value: &str) -> Result<(), Error>;

    async fn delete(&self, site_uri: &SiteUri) -> Result<(), Error>;

    async fn delete_all(&self) -> Result<(), Error>;
}
