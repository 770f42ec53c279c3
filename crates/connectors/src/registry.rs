use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{ConnectorError, Direction, Downloader, Uploader};

/// Identifier to connector table for one transfer direction.
pub struct ConnectorRegistry<C: ?Sized> {
    direction: Direction,
    entries: HashMap<String, Arc<C>>,
}

pub type DownloaderRegistry = ConnectorRegistry<dyn Downloader>;
pub type UploaderRegistry = ConnectorRegistry<dyn Uploader>;

impl<C: ?Sized> ConnectorRegistry<C> {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the connector for `id`.
    pub fn register(&mut self, id: impl Into<String>, connector: Arc<C>) -> &mut Self {
        self.entries.insert(id.into(), connector);
        self
    }

    /// Combine two tables; entries in `overrides` replace same-named ones in
    /// `first_party`.
    pub fn merge(first_party: Self, overrides: Self) -> Self {
        let mut merged = first_party;
        for (id, connector) in overrides.entries {
            if merged.entries.contains_key(&id) {
                debug!(id = %id, direction = %merged.direction, "Connector overridden");
            }
            merged.entries.insert(id, connector);
        }
        merged
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<C>, ConnectorError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownConnector {
                id: id.to_string(),
                direction: self.direction,
            })
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
