//! Batch accumulation across concurrent producers.
//!
//! One coordinating task owns the [`RefreshBatch`]; producers send it change
//! notifications over a channel. When every producer handle has been dropped
//! and [`BatchAccumulator::finish`] is awaited, the task hands back the
//! merged batch for a single resolution pass.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::batch::RefreshBatch;
use crate::Error;
use crate::model::ElementChange;
use crate::registry::ElementTypeRegistry;

#[derive(Debug)]
enum Notification {
    Element(Box<ElementChange>),
    Tags(Vec<String>),
    CacheIds(Vec<i64>),
}

/// Sending half handed to producers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BatchProducer {
    tx: mpsc::UnboundedSender<Notification>,
}

impl BatchProducer {
    pub fn add_element(&self, change: ElementChange) -> Result<(), Error> {
        self.send(Notification::Element(Box::new(change)))
    }

    pub fn add_tags<I, S>(&self, tags: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Notification::Tags(tags.into_iter().map(Into::into).collect()))
    }

    pub fn add_cache_ids(&self, cache_ids: impl IntoIterator<Item = i64>) -> Result<(), Error> {
        self.send(Notification::CacheIds(cache_ids.into_iter().collect()))
    }

    fn send(&self, notification: Notification) -> Result<(), Error> {
        self.tx
            .send(notification)
            .map_err(|_| Error::Queue("batch accumulator has already finished".to_string()))
    }
}

/// Owner of one logical operation's batch.
#[derive(Debug)]
pub struct BatchAccumulator {
    producer: BatchProducer,
    task: JoinHandle<RefreshBatch>,
}

impl BatchAccumulator {
    /// Spawn the coordinating task on the current runtime.
    pub fn spawn(registry: ElementTypeRegistry) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut batch = RefreshBatch::default();
            let mut received = 0usize;
            while let Some(notification) = rx.recv().await {
                received += 1;
                match notification {
                    Notification::Element(change) => {
                        batch.add_change(&change, &registry, Utc::now());
                    }
                    Notification::Tags(tags) => batch.add_tags(tags),
                    Notification::CacheIds(cache_ids) => batch.add_cache_ids(cache_ids),
                }
            }
            tracing::debug!(received, elements = batch.element_count(), "batch accumulation finished");
            batch
        });
        Self { producer: BatchProducer { tx }, task }
    }

    pub fn producer(&self) -> BatchProducer {
        self.producer.clone()
    }

    /// Wait for every producer to drop, then return the merged batch.
    pub async fn finish(self) -> Result<RefreshBatch, Error> {
        let Self { producer, task } = self;
        drop(producer);
        task.await.map_err(|e| Error::Queue(format!("batch accumulator task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::model::{Element, ElementStatus};

    fn edited(id: i64, section: i64) -> ElementChange {
        ElementChange::saved(Element::new(id, "entry").with_attribute("sectionId", section))
            .with_previous_status(ElementStatus::Live)
            .with_changed_attribute("title")
    }

    #[tokio::test]
    async fn test_concurrent_producers_merge_into_one_batch() {
        let accumulator = BatchAccumulator::spawn(ElementTypeRegistry::with_defaults());

        let mut handles = Vec::new();
        for id in 1..=20_i64 {
            let producer = accumulator.producer();
            handles.push(tokio::spawn(async move {
                producer.add_element(edited(id, id % 3 + 1)).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        accumulator.producer().add_tags(["nav"]).unwrap();

        let batch = accumulator.finish().await.unwrap();
        let entries = &batch.elements["entry"];
        assert_eq!(entries.element_ids.len(), 20);
        assert_eq!(entries.source_ids, BTreeSet::from([1, 2, 3]));
        assert!(batch.tags.contains("nav"));
    }

    #[tokio::test]
    async fn test_unchanged_elements_do_not_enter_batch() {
        let accumulator = BatchAccumulator::spawn(ElementTypeRegistry::with_defaults());
        let unchanged = ElementChange::saved(Element::new(1, "entry")).with_previous_status(ElementStatus::Live);
        accumulator.producer().add_element(unchanged).unwrap();

        assert!(accumulator.finish().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_waits_for_outstanding_producers() {
        let accumulator = BatchAccumulator::spawn(ElementTypeRegistry::with_defaults());
        let producer = accumulator.producer();
        let late = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            producer.add_cache_ids([7]).unwrap();
        });

        let batch = accumulator.finish().await.unwrap();
        late.await.unwrap();
        assert_eq!(batch.cache_ids, BTreeSet::from([7]));
    }
}
