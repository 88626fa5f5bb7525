//! Reverse-dependency cache invalidation for full-page caching.
//!
//! This crate provides:
//! - Dependency recording while a page renders ([`DependencyRecorder`])
//! - Query signatures that let unseen elements invalidate listings
//! - Batched refresh of affected cache entries ([`RefreshCache`])
//! - Scheduled refresh of future-dated elements ([`ExpiryTracker`])
//! - SQLite persistence, cache stores and a job queue
//! - Configuration and tracing setup

pub mod cache;
pub mod config;
pub mod error;
pub mod expiry;
mod lock;
pub mod model;
pub mod output;
pub mod queue;
pub mod recorder;
pub mod refresh;
pub mod registry;
pub mod signature;
pub mod storage;
pub mod telemetry;

pub use cache::{CacheDb, PurgeMode};
pub use config::{CacheConfig, ConfigError};
pub use error::Error;
pub use expiry::{ExpiryTracker, SweepOutcome};
pub use model::{CacheEntry, DependencySet, Element, ElementChange, ElementStatus, SiteUri, TrackedFields};
pub use output::OutputComments;
pub use queue::{Job, JobFilter, JobQueue, MemoryQueue};
pub use recorder::{DependencyRecorder, GenerateOptions};
pub use refresh::{
    BatchAccumulator, BatchProducer, RefreshBatch, RefreshCache, RefreshJob, RefreshJobPayload, RefreshOutcome,
    RefreshSettings,
};
pub use registry::{ElementTypeDef, ElementTypeRegistry};
pub use signature::{ElementQuery, QuerySignature, SignatureCodec, SkipReason};
pub use storage::{CacheStorage, FileStorage, MemoryStorage};
