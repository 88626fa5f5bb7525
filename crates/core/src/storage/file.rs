//! Static-file cache store.
//!
//! Pages are written to `{root}/{site_id}/{path}/index.html` so a web server
//! can serve them directly. Query-string variants get a hashed file name next
//! to the plain page.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::CacheStorage;
use crate::Error;
use crate::cache::hash::short_digest;
use crate::model::SiteUri;

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for a cached page; rejects URIs that would escape the root.
    pub fn file_path(&self, site_uri: &SiteUri) -> Result<PathBuf, Error> {
        let mut path = self.root.join(site_uri.site_id.to_string());
        for segment in site_uri.path().split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(Error::InvalidInput(format!("URI escapes storage root: {}", site_uri.uri))),
                segment if segment.contains('\\') || segment.contains('\0') => {
                    return Err(Error::InvalidInput(format!("invalid URI segment: {segment:?}")));
                }
                segment => path.push(segment),
            }
        }
        let file_name = match site_uri.query() {
            Some(query) => format!("index-{}.html", short_digest(query)),
            None => "index.html".to_string(),
        };
        Ok(path.join(file_name))
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn get(&self, site_uri: &SiteUri) -> Result<Option<String>, Error> {
        let path = self.file_path(site_uri)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, site_uri: &SiteUri, value: &str) -> Result<(), Error> {
        let path = self.file_path(site_uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, value).await?;
        Ok(())
    }

    async fn delete(&self, site_uri: &SiteUri) -> Result<(), Error> {
        let path = self.file_path(site_uri)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self) -> Result<(), Error> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(root = %self.root.display(), "cleared file cache store");
        Ok(())
    }
}
