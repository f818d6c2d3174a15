use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::producer::Producer;
use crate::stores::{self, Store, StoreError};
use crate::transport::{DriverError, Transport};

/// Derived changelog topic name. The publishing path and the recovery reader
/// must compute the same string.
pub fn changelog_topic_name(app_id: &str, table_name: &str) -> String {
    format!("{app_id}-{table_name}-changelog")
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("missing key and no default factory configured")]
    MissingKey,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("changelog publish rejected: {0}")]
    Changelog(#[from] DriverError),
}

type DefaultFactory = Arc<dyn Fn() -> Bytes + Send + Sync>;

/// Declarative description of a table. Carries no data; binding resolves the
/// backing store and derives the changelog topic.
pub struct TableSpec {
    pub name: String,
    /// Backing store URL; the app-wide store is used when absent.
    pub store_url: Option<String>,
    /// Value factory for missing keys; absence makes missing keys an error.
    pub default: Option<DefaultFactory>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store_url: None,
            default: None,
        }
    }

    pub fn store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    pub fn default_factory(
        mut self,
        factory: impl Fn() -> Bytes + Send + Sync + 'static,
    ) -> Self {
        self.default = Some(Arc::new(factory));
        self
    }
}

/// Keyed materialized view whose every mutation is mirrored onto a derived
/// changelog topic, making the view reconstructible by replay after failure.
///
/// Mutations return once the changelog record is accepted into the producer
/// queue; broker durability is watched in the background. A failed publish
/// does not roll the local write back, the next successful write or a full
/// recovery replay reconciles.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

struct TableInner {
    name: String,
    changelog_topic: String,
    store: Arc<dyn Store>,
    default: Option<DefaultFactory>,
    producer: Producer,
}

impl Table {
    /// Binds a declarative spec: resolves the backing store from its URL and
    /// derives the changelog topic from the application id.
    pub fn bind(
        app_id: &str,
        spec: TableSpec,
        producer: Producer,
        app_store_url: &str,
    ) -> Result<Table, TableError> {
        let store_url = spec.store_url.as_deref().unwrap_or(app_store_url);
        let store = stores::by_url(store_url)?;
        let changelog_topic = changelog_topic_name(app_id, &spec.name);
        info!(
            table = spec.name,
            store = store_url,
            changelog = changelog_topic,
            "table bound"
        );
        Ok(Table {
            inner: Arc::new(TableInner {
                name: spec.name,
                changelog_topic,
                store,
                default: spec.default,
                producer,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn changelog_topic(&self) -> &str {
        &self.inner.changelog_topic
    }

    /// Looks up a key. A missing key yields the default factory's value,
    /// inserted and published like any other write, or an error when no
    /// factory was configured.
    pub fn get(&self, key: &[u8]) -> Result<Bytes, TableError> {
        if let Some(value) = self.inner.store.get(key) {
            return Ok(value);
        }
        match &self.inner.default {
            Some(factory) => {
                let value = factory();
                self.set(Bytes::copy_from_slice(key), value.clone())?;
                Ok(value)
            }
            None => Err(TableError::MissingKey),
        }
    }

    /// Writes a key, then mirrors the write onto the changelog.
    pub fn set(&self, key: Bytes, value: Bytes) -> Result<(), TableError> {
        self.inner.store.set(key.clone(), value.clone());
        self.publish(key, Some(value))
    }

    /// Removes a key, mirroring a tombstone onto the changelog. Removing an
    /// absent key is a no-op and publishes nothing.
    pub fn del(&self, key: &[u8]) -> Result<bool, TableError> {
        if !self.inner.store.del(key) {
            return Ok(false);
        }
        self.publish(Bytes::copy_from_slice(key), None)?;
        Ok(true)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.store.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Streams the mapping in key order without materializing it.
    pub fn iter(&self) -> impl Iterator<Item = (Bytes, Bytes)> + '_ {
        self.inner.store.iter()
    }

    /// Eager copy of the mapping, for small tables and tests.
    pub fn snapshot(&self) -> Vec<(Bytes, Bytes)> {
        self.inner.store.snapshot()
    }

    /// Stream hook: records the processed value under the event's key, then
    /// hands the original value back for downstream forwarding.
    pub fn on_done(&self, key: Bytes, value: Bytes) -> Result<Bytes, TableError> {
        self.set(key, value.clone())?;
        Ok(value)
    }

    /// Rebuilds the backing store by replaying the changelog from its
    /// earliest offset; tombstones delete. Must finish before the table
    /// serves reads.
    pub async fn recover(&self, transport: &dyn Transport) -> Result<usize, DriverError> {
        self.inner.store.clear();
        let records = transport.read_to_end(&self.inner.changelog_topic).await?;
        let mut applied = 0;
        for record in records {
            let Some(key) = record.key else {
                warn!(
                    table = self.inner.name,
                    offset = record.offset,
                    "changelog record without key ignored"
                );
                continue;
            };
            match record.value {
                Some(value) => self.inner.store.set(key, value),
                None => {
                    self.inner.store.del(&key);
                }
            }
            applied += 1;
        }
        info!(
            table = self.inner.name,
            records = applied,
            entries = self.inner.store.len(),
            "table recovered from changelog"
        );
        Ok(applied)
    }

    fn publish(&self, key: Bytes, value: Option<Bytes>) -> Result<(), TableError> {
        let delivery = self
            .inner
            .producer
            .send(&self.inner.changelog_topic, Some(key), value)?;
        let topic = self.inner.changelog_topic.clone();
        // Watch the broker ack off to the side; the local write stands
        // either way.
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = delivery.wait().await {
                    error!("changelog publish to {topic} failed: {err}");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::changelog_topic_name;

    #[test]
    fn changelog_topic_is_derived_from_app_and_table() {
        assert_eq!(
            changelog_topic_name("orders-app", "totals"),
            "orders-app-totals-changelog"
        );
    }
}
