//! Keyed resource table
//!
//! Writers that fan out to several targets (one file per partition, one
//! stream per table) keep their open handles here. A handle is opened on
//! first use and closed together with all others when the writer prepares
//! a commit.

use crate::error::ConnectorResult;
use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::warn;

/// Something a writer opens per key and must close before committing
#[async_trait]
pub trait SinkResource: Send {
    async fn close(&mut self) -> ConnectorResult<()>;
}

#[derive(Debug)]
pub struct ResourceTable<K, R> {
    resources: BTreeMap<K, R>,
}

impl<K, R> Default for ResourceTable<K, R> {
    fn default() -> Self {
        Self {
            resources: BTreeMap::new(),
        }
    }
}

impl<K, R> ResourceTable<K, R>
where
    K: Ord + Clone + std::fmt::Debug + Send,
    R: SinkResource,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the resource for `key`, opening it with `open` if absent.
    ///
    /// A failed open leaves the table unchanged.
    pub async fn get_or_open<F, Fut>(&mut self, key: &K, open: F) -> ConnectorResult<&mut R>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = ConnectorResult<R>>,
    {
        match self.resources.entry(key.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let resource = open(e.key()).await?;
                Ok(e.insert(resource))
            }
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut R> {
        self.resources.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.resources.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.resources.keys()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Remove every resource without closing it
    pub fn drain(&mut self) -> BTreeMap<K, R> {
        std::mem::take(&mut self.resources)
    }

    /// Close and remove every resource.
    ///
    /// All resources are closed even if one fails; the first error is returned.
    pub async fn close_all(&mut self) -> ConnectorResult<Vec<K>> {
        let mut first_error = None;
        let mut closed = Vec::with_capacity(self.resources.len());
        for (key, mut resource) in self.drain() {
            match resource.close().await {
                Ok(()) => closed.push(key),
                Err(e) => {
                    warn!(key = ?key, error = %e, "Failed to close resource");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Handle {
        name: String,
        fail: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SinkResource for Handle {
        async fn close(&mut self) -> ConnectorResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectorError::connection(format!("{} broken", self.name)));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_opens_once_per_key() {
        let closed = Arc::new(AtomicUsize::new(0));
        let opened = AtomicUsize::new(0);
        let mut table: ResourceTable<String, Handle> = ResourceTable::new();

        for _ in 0..3 {
            table
                .get_or_open(&"a".to_string(), |k| {
                    opened.fetch_add(1, Ordering::SeqCst);
                    let h = Handle {
                        name: k.clone(),
                        fail: false,
                        closed: closed.clone(),
                    };
                    async move { Ok(h) }
                })
                .await
                .unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_entry() {
        let mut table: ResourceTable<String, Handle> = ResourceTable::new();
        let result = table
            .get_or_open(&"a".to_string(), |_| async {
                Err::<Handle, _>(ConnectorError::connection("refused"))
            })
            .await;
        assert!(result.is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_closes_everything_and_reports_first_error() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut table: ResourceTable<String, Handle> = ResourceTable::new();
        for (name, fail) in [("a", false), ("b", true), ("c", false)] {
            let h = Handle {
                name: name.to_string(),
                fail,
                closed: closed.clone(),
            };
            table
                .get_or_open(&name.to_string(), |_| async move { Ok(h) })
                .await
                .unwrap();
        }

        let err = table.close_all().await.unwrap_err();
        assert!(err.to_string().contains("b broken"));
        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert!(table.is_empty());
    }
}
