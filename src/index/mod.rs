mod milvus;

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use serde_json::{Map, Value};

use crate::config::IndexSettings;
use crate::error::{IndexError, IndexResult};

pub use milvus::{MilvusConnector, MilvusRestIndex};

/// Server-side load state of a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    NotExist,
    NotLoad,
    Loading,
    Loaded,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchRequest {
    pub collection: String,
    pub vector: Vec<f32>,
    pub anns_field: String,
    pub metric_type: String,
    pub level: u32,
    pub limit: usize,
    pub output_fields: Vec<String>,
}

/// One search result. `entity` is `None` when the index returned no payload.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SearchHit {
    pub distance: f32,
    pub entity: Option<Map<String, Value>>,
}

impl SearchHit {
    /// Named field lookup; missing or non-string fields read as `None`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.entity.as_ref()?.get(name)?.as_str()
    }
}

pub trait VectorIndex: Send + Sync {
    fn has_collection(&self, name: &str) -> IndexResult<bool>;

    fn load(&self, name: &str) -> IndexResult<()>;

    fn load_state(&self, name: &str) -> IndexResult<LoadState>;

    /// Hits ordered best match first, as defined by the index metric.
    fn search(&self, request: &SearchRequest) -> IndexResult<Vec<SearchHit>>;

    /// Poll [`VectorIndex::load_state`] until the collection is loaded.
    fn wait_for_loading_complete(&self, name: &str, timeout: Duration) -> IndexResult<()> {
        let started = Instant::now();
        loop {
            match self.load_state(name)? {
                LoadState::Loaded => return Ok(()),
                LoadState::NotExist => return Err(IndexError::CollectionNotFound(name.to_string())),
                LoadState::NotLoad | LoadState::Loading => {}
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(IndexError::LoadTimeout {
                    collection: name.to_string(),
                    timeout,
                });
            }
            std::thread::sleep(LOAD_POLL_INTERVAL.min(timeout - elapsed));
        }
    }
}

const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Opens a connection to an index.
pub trait IndexConnector: Send + Sync {
    fn connect(&self, uri: &str, token: &str) -> IndexResult<Arc<dyn VectorIndex>>;
}

/// Holds at most one live index connection for the process.
pub struct VectorIndexClient {
    settings: IndexSettings,
    connector: Box<dyn IndexConnector>,
    connection: OnceCell<Arc<dyn VectorIndex>>,
}

impl VectorIndexClient {
    pub fn new(settings: IndexSettings, connector: Box<dyn IndexConnector>) -> Self {
        Self {
            settings,
            connector,
            connection: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.get().is_some()
    }

    /// Connect once; later calls reuse the live connection.
    pub fn connect(&self) -> IndexResult<Arc<dyn VectorIndex>> {
        if self.is_connected() {
            tracing::debug!("reusing vector index connection");
        }
        let conn = self.connection.get_or_try_init(|| {
            self.settings.check()?;
            let uri = self.settings.uri.as_deref().unwrap_or_default();
            let token = self.settings.token.as_deref().unwrap_or_default();
            tracing::info!(uri = %uri, "connecting to vector index");
            let conn = self.connector.connect(uri, token)?;
            tracing::info!("connected to vector index");
            Ok::<_, IndexError>(conn)
        })?;
        Ok(Arc::clone(conn))
    }

    /// Make `name` searchable within `timeout`. Any failure is logged and
    /// yields `None`, which callers treat as "retrieval unavailable".
    pub fn ensure_loaded(&self, name: &str, timeout: Duration) -> Option<LoadedCollection> {
        match self.try_ensure_loaded(name, timeout) {
            Ok(collection) => Some(collection),
            Err(err) => {
                tracing::error!(collection = %name, error = %err, "vector index collection unavailable");
                None
            }
        }
    }

    fn try_ensure_loaded(&self, name: &str, timeout: Duration) -> IndexResult<LoadedCollection> {
        let index = self.connect()?;
        if !index.has_collection(name)? {
            return Err(IndexError::CollectionNotFound(name.to_string()));
        }
        tracing::info!(collection = %name, "loading collection for search");
        index.load(name)?;
        index.wait_for_loading_complete(name, timeout)?;
        tracing::info!(collection = %name, "collection loading complete");
        Ok(LoadedCollection {
            index,
            name: name.to_string(),
            anns_field: self.settings.anns_field.clone(),
            metric_type: self.settings.metric_type.clone(),
            level: self.settings.search_level,
        })
    }
}

/// A collection that reported fully loaded.
#[derive(Clone)]
pub struct LoadedCollection {
    index: Arc<dyn VectorIndex>,
    name: String,
    anns_field: String,
    metric_type: String,
    level: u32,
}

impl LoadedCollection {
    pub fn new(index: Arc<dyn VectorIndex>, name: impl Into<String>, settings: &IndexSettings) -> Self {
        Self {
            index,
            name: name.into(),
            anns_field: settings.anns_field.clone(),
            metric_type: settings.metric_type.clone(),
            level: settings.search_level,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_search(
        &self,
        vector: Vec<f32>,
        k: usize,
        output_fields: &[String],
    ) -> IndexResult<Vec<SearchHit>> {
        let request = SearchRequest {
            collection: self.name.clone(),
            vector,
            anns_field: self.anns_field.clone(),
            metric_type: self.metric_type.clone(),
            level: self.level,
            limit: k,
            output_fields: output_fields.to_vec(),
        };
        let mut hits = self.index.search(&request)?;
        hits.truncate(k);
        Ok(hits)
    }

    /// Like [`LoadedCollection::try_search`] but errors are logged and read as no hits.
    pub fn search(&self, vector: Vec<f32>, k: usize, output_fields: &[String]) -> Vec<SearchHit> {
        match self.try_search(vector, k, output_fields) {
            Ok(hits) => hits,
            Err(err) => {
                tracing::error!(collection = %self.name, error = %err, "vector search failed");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for LoadedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedCollection")
            .field("name", &self.name)
            .field("anns_field", &self.anns_field)
            .field("metric_type", &self.metric_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeIndex {
        has: bool,
        states: Mutex<Vec<LoadState>>,
        fail_search: bool,
        searches: AtomicUsize,
    }

    impl VectorIndex for FakeIndex {
        fn has_collection(&self, _name: &str) -> IndexResult<bool> {
            Ok(self.has)
        }

        fn load(&self, _name: &str) -> IndexResult<()> {
            Ok(())
        }

        fn load_state(&self, _name: &str) -> IndexResult<LoadState> {
            let mut states = self.states.lock().expect("lock");
            if states.len() > 1 {
                Ok(states.remove(0))
            } else {
                Ok(states.first().copied().unwrap_or(LoadState::Loaded))
            }
        }

        fn search(&self, request: &SearchRequest) -> IndexResult<Vec<SearchHit>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            if self.fail_search {
                return Err(IndexError::Api {
                    code: 1100,
                    message: "boom".to_string(),
                });
            }
            Ok((0..request.limit + 2)
                .map(|i| SearchHit {
                    distance: 1.0 - i as f32 * 0.1,
                    entity: None,
                })
                .collect())
        }
    }

    struct CountingConnector {
        index: Arc<FakeIndex>,
        calls: Arc<AtomicUsize>,
    }

    impl IndexConnector for CountingConnector {
        fn connect(&self, _uri: &str, _token: &str) -> IndexResult<Arc<dyn VectorIndex>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.index.clone())
        }
    }

    fn settings() -> IndexSettings {
        IndexSettings {
            uri: Some("https://example".to_string()),
            token: Some("t".to_string()),
            ..IndexSettings::default()
        }
    }

    fn client(index: FakeIndex) -> (VectorIndexClient, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            index: Arc::new(index),
            calls: calls.clone(),
        };
        (VectorIndexClient::new(settings(), Box::new(connector)), calls)
    }

    #[test]
    fn connect_is_idempotent() {
        let (client, calls) = client(FakeIndex {
            has: true,
            ..FakeIndex::default()
        });
        client.connect().expect("first");
        client.connect().expect("second");
        client.ensure_loaded("c", Duration::from_secs(1)).expect("loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(client.is_connected());
    }

    #[test]
    fn connect_without_credentials_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            index: Arc::new(FakeIndex::default()),
            calls: calls.clone(),
        };
        let client = VectorIndexClient::new(IndexSettings::default(), Box::new(connector));
        assert!(matches!(client.connect(), Err(IndexError::Config(_))));
        assert!(client.ensure_loaded("c", Duration::from_secs(1)).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_collection_is_unusable() {
        let (client, _) = client(FakeIndex::default());
        assert!(client.ensure_loaded("absent", Duration::from_secs(1)).is_none());
    }

    #[test]
    fn waits_until_loaded() {
        let (client, _) = client(FakeIndex {
            has: true,
            states: Mutex::new(vec![LoadState::Loading, LoadState::Loaded]),
            ..FakeIndex::default()
        });
        let loaded = client.ensure_loaded("c", Duration::from_secs(5)).expect("loaded");
        assert_eq!(loaded.name(), "c");
    }

    #[test]
    fn load_timeout_leaves_collection_unusable() {
        let (client, _) = client(FakeIndex {
            has: true,
            states: Mutex::new(vec![LoadState::Loading]),
            ..FakeIndex::default()
        });
        assert!(client.ensure_loaded("c", Duration::from_millis(10)).is_none());
    }

    #[test]
    fn search_truncates_to_k_and_swallows_errors() {
        let index = Arc::new(FakeIndex::default());
        let coll = LoadedCollection::new(index.clone(), "c", &settings());
        let hits = coll.search(vec![0.0; 4], 3, &[]);
        assert_eq!(hits.len(), 3);
        assert!(hits[0].distance > hits[1].distance);

        let failing = Arc::new(FakeIndex {
            fail_search: true,
            ..FakeIndex::default()
        });
        let coll = LoadedCollection::new(failing.clone(), "c", &settings());
        assert!(coll.search(vec![0.0; 4], 3, &[]).is_empty());
        assert!(coll.try_search(vec![0.0; 4], 3, &[]).is_err());
        assert_eq!(failing.searches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hit_field_lookup_handles_missing_values() {
        let mut entity = Map::new();
        entity.insert("francais".to_string(), Value::from("Bonjour"));
        entity.insert("count".to_string(), Value::from(3));
        let hit = SearchHit {
            distance: 0.5,
            entity: Some(entity),
        };
        assert_eq!(hit.field("francais"), Some("Bonjour"));
        assert_eq!(hit.field("breton"), None);
        assert_eq!(hit.field("count"), None);
        assert_eq!(SearchHit::default().field("francais"), None);
    }
}
