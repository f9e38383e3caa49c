// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Saved servers and their tags.
//!
//! The registry is one JSON document. Every mutation rewrites it through a
//! temp file and a rename, so a crash leaves either the old or the new
//! document on disk.
//!
//! ```json
//! {
//!   "servers": [
//!     { "id": "opc.tcp://plc-01:4840", "endpoint": "opc.tcp://plc-01:4840",
//!       "name": "Line 1", "tags": [ { "node_id": "ns=2;i=1", "path": "Objects/PLC1/Speed" } ] }
//!   ]
//! }
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Environment variable naming the registry directory.
pub const STATE_DIR_ENV: &str = "VIGIL_STATE_DIR";

/// File name of the registry document.
pub const STATE_FILE_NAME: &str = "state.json";

/// A saved server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedServer {
    /// Server identifier. The endpoint URL.
    pub id: String,
    /// Endpoint URL.
    pub endpoint: String,
    /// Display name.
    pub name: String,
    /// Saved tags.
    #[serde(default)]
    pub tags: Vec<SavedTag>,
}

/// A saved tag of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTag {
    /// Node identifier.
    pub node_id: String,
    /// Browse path shown to operators.
    pub path: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    servers: Vec<SavedServer>,
}

/// JSON-backed store of saved servers and tags.
#[derive(Debug)]
pub struct ServerRegistry {
    path: PathBuf,
    /// Serialises read-modify-write cycles.
    lock: Mutex<()>,
}

impl ServerRegistry {
    /// Opens the registry at `path`, creating an empty document if needed.
    pub fn open(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }

        let registry = Self {
            path,
            lock: Mutex::new(()),
        };
        if !registry.path.exists() {
            registry.write(&RegistryDocument::default())?;
        }
        Ok(registry)
    }

    /// Returns the default location: `$VIGIL_STATE_DIR/state.json`, or
    /// `./data/state.json`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(STATE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"))
            .join(STATE_FILE_NAME)
    }

    /// Returns the document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lists saved servers in insertion order.
    pub fn list_servers(&self) -> ConfigResult<Vec<SavedServer>> {
        let _guard = self.lock.lock();
        Ok(self.read()?.servers)
    }

    /// Saves a server keyed by its endpoint. An existing entry keeps its
    /// tags and only has its name replaced when `name` is given.
    pub fn upsert_server(&self, endpoint: &str, name: Option<&str>) -> ConfigResult<SavedServer> {
        let _guard = self.lock.lock();
        let mut document = self.read()?;

        let saved = match document.servers.iter_mut().find(|s| s.id == endpoint) {
            Some(server) => {
                if let Some(name) = name {
                    server.name = name.to_string();
                }
                server.clone()
            }
            None => {
                let server = SavedServer {
                    id: endpoint.to_string(),
                    endpoint: endpoint.to_string(),
                    name: name.unwrap_or(endpoint).to_string(),
                    tags: Vec::new(),
                };
                document.servers.push(server.clone());
                server
            }
        };

        self.write(&document)?;
        tracing::debug!(server_id = %saved.id, "Server saved");
        Ok(saved)
    }

    /// Deletes a server and its tags. Returns whether it existed.
    pub fn delete_server(&self, server_id: &str) -> ConfigResult<bool> {
        let _guard = self.lock.lock();
        let mut document = self.read()?;

        let before = document.servers.len();
        document.servers.retain(|s| s.id != server_id);
        let removed = document.servers.len() != before;

        if removed {
            self.write(&document)?;
        }
        Ok(removed)
    }

    /// Lists the tags of a server; empty for an unknown server.
    pub fn list_tags(&self, server_id: &str) -> ConfigResult<Vec<SavedTag>> {
        let _guard = self.lock.lock();
        Ok(self
            .read()?
            .servers
            .into_iter()
            .find(|s| s.id == server_id)
            .map(|s| s.tags)
            .unwrap_or_default())
    }

    /// Saves a tag. Saving a node twice keeps the first entry.
    pub fn add_tag(&self, server_id: &str, node_id: &str, path: &str) -> ConfigResult<()> {
        let _guard = self.lock.lock();
        let mut document = self.read()?;

        let server = document
            .servers
            .iter_mut()
            .find(|s| s.id == server_id)
            .ok_or_else(|| ConfigError::unknown_server(server_id))?;

        if server.tags.iter().any(|t| t.node_id == node_id) {
            return Ok(());
        }
        server.tags.push(SavedTag {
            node_id: node_id.to_string(),
            path: path.to_string(),
        });

        self.write(&document)
    }

    /// Removes a tag. Returns whether it existed.
    pub fn remove_tag(&self, server_id: &str, node_id: &str) -> ConfigResult<bool> {
        let _guard = self.lock.lock();
        let mut document = self.read()?;

        let Some(server) = document.servers.iter_mut().find(|s| s.id == server_id) else {
            return Ok(false);
        };
        let before = server.tags.len();
        server.tags.retain(|t| t.node_id != node_id);
        let removed = server.tags.len() != before;

        if removed {
            self.write(&document)?;
        }
        Ok(removed)
    }

    fn read(&self) -> ConfigResult<RegistryDocument> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryDocument::default())
            }
            Err(e) => return Err(ConfigError::io(&self.path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| ConfigError::parse(&self.path, e.to_string()))
    }

    fn write(&self, document: &RegistryDocument) -> ConfigResult<()> {
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| ConfigError::serialization(e.to_string()))?;
        let temp = self.path.with_extension("json.tmp");

        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp, &self.path)
        })();

        result.map_err(|e| {
            let _ = fs::remove_file(&temp);
            ConfigError::io(&self.path, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PLC: &str = "opc.tcp://plc-01:4840";

    fn open(dir: &TempDir) -> ServerRegistry {
        ServerRegistry::open(dir.path().join("state").join(STATE_FILE_NAME)).unwrap()
    }

    #[test]
    fn test_open_creates_empty_document() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);
        assert!(registry.path().exists());
        assert!(registry.list_servers().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_server() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);

        let saved = registry.upsert_server(PLC, None).unwrap();
        assert_eq!(saved.id, PLC);
        assert_eq!(saved.name, PLC);

        registry.add_tag(PLC, "ns=2;i=1", "Objects/PLC1/Speed").unwrap();
        let renamed = registry.upsert_server(PLC, Some("Line 1")).unwrap();
        assert_eq!(renamed.name, "Line 1");
        assert_eq!(renamed.tags.len(), 1);

        let kept = registry.upsert_server(PLC, None).unwrap();
        assert_eq!(kept.name, "Line 1");
        assert_eq!(registry.list_servers().unwrap().len(), 1);
    }

    #[test]
    fn test_tags_are_idempotent_per_node() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);
        registry.upsert_server(PLC, Some("Line 1")).unwrap();

        registry.add_tag(PLC, "ns=2;i=1", "Objects/PLC1/Speed").unwrap();
        registry.add_tag(PLC, "ns=2;i=1", "Objects/PLC1/Other").unwrap();
        registry.add_tag(PLC, "ns=2;i=2", "Objects/PLC1/Mode").unwrap();

        let tags = registry.list_tags(PLC).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].path, "Objects/PLC1/Speed");

        assert!(registry.remove_tag(PLC, "ns=2;i=1").unwrap());
        assert!(!registry.remove_tag(PLC, "ns=2;i=1").unwrap());
        assert_eq!(registry.list_tags(PLC).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_server() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);

        assert!(matches!(
            registry.add_tag("opc.tcp://nowhere:4840", "ns=2;i=1", "x"),
            Err(ConfigError::UnknownServer { .. })
        ));
        assert!(registry.list_tags("opc.tcp://nowhere:4840").unwrap().is_empty());
        assert!(!registry.remove_tag("opc.tcp://nowhere:4840", "ns=2;i=1").unwrap());
        assert!(!registry.delete_server("opc.tcp://nowhere:4840").unwrap());
    }

    #[test]
    fn test_persisted_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = open(&dir);
            registry.upsert_server(PLC, Some("Line 1")).unwrap();
            registry.upsert_server("opc.tcp://plc-02:4840", None).unwrap();
            registry.add_tag(PLC, "ns=2;i=1", "Objects/PLC1/Speed").unwrap();
            assert!(registry.delete_server("opc.tcp://plc-02:4840").unwrap());
        }

        let registry = open(&dir);
        let servers = registry.list_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "Line 1");
        assert_eq!(servers[0].tags[0].node_id, "ns=2;i=1");
        assert!(!registry.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupted_document_is_reported() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir);
        fs::write(registry.path(), b"{ not json").unwrap();

        assert!(matches!(
            registry.list_servers(),
            Err(ConfigError::Parse { .. })
        ));
        assert!(registry.upsert_server(PLC, None).is_err());
    }
}
