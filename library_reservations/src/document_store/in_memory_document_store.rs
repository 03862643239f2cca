use std::collections::BTreeMap;

use itertools::Itertools;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::document_store::{
    validate_path, Document, DocumentStore, StoreError, TransactionOutcome, UpdateFn,
    CHANGE_FEED_CAPACITY,
};

pub struct InMemoryDocumentStore {
    documents: RwLock<BTreeMap<String, Document>>,
    changes: broadcast::Sender<String>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            documents: Default::default(),
            changes,
        }
    }
}

impl InMemoryDocumentStore {
    fn notify(&self, path: &str) {
        // nobody listening is fine
        let _ = self.changes.send(path.to_string());
    }

    /// Every stored path with its value, in path order
    pub fn dump(&self) -> Vec<(String, Document)> {
        self.documents
            .read()
            .iter()
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }

    fn descendants<'a>(
        documents: &'a BTreeMap<String, Document>,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Document)> + 'a {
        documents
            .range(prefix.to_string()..)
            .take_while(move |(path, _)| path.starts_with(prefix))
            .map(move |(path, value)| (&path[prefix.len()..], value))
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        validate_path(path)?;
        Ok(self.documents.read().get(path).cloned())
    }

    async fn set(&self, path: &str, value: Document) -> Result<(), StoreError> {
        validate_path(path)?;
        self.documents.write().insert(path.to_string(), value);
        self.notify(path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        validate_path(path)?;
        if self.documents.write().remove(path).is_some() {
            self.notify(path);
        }
        Ok(())
    }

    async fn children(&self, parent: &str) -> Result<Vec<(String, Document)>, StoreError> {
        validate_path(parent)?;
        let prefix = format!("{parent}/");
        let documents = self.documents.read();
        Ok(Self::descendants(&documents, &prefix)
            .filter(|(rest, _)| !rest.contains('/'))
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect())
    }

    async fn child_keys(&self, parent: &str) -> Result<Vec<String>, StoreError> {
        validate_path(parent)?;
        let prefix = format!("{parent}/");
        let documents = self.documents.read();
        Ok(Self::descendants(&documents, &prefix)
            .filter_map(|(rest, _)| rest.split('/').next())
            .dedup()
            .map(str::to_string)
            .collect())
    }

    async fn transaction(
        &self,
        path: &str,
        update: &UpdateFn<'_>,
    ) -> Result<TransactionOutcome, StoreError> {
        validate_path(path)?;
        let outcome = {
            let mut documents = self.documents.write();
            let previous = documents.get(path).cloned();
            let current = update(previous.as_ref())?;
            match &current {
                Some(value) => {
                    documents.insert(path.to_string(), value.clone());
                }
                None => {
                    documents.remove(path);
                }
            }
            TransactionOutcome { previous, current }
        };
        if outcome.previous != outcome.current {
            self.notify(path);
        }
        Ok(outcome)
    }

    fn changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}
