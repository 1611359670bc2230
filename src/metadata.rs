// Copyright 2020 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The two string-to-string metadata maps: user metadata synced down from
//! the hub and mirrored to hint files, device metadata collected locally
//! and uploaded when dirty.

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, read_dir, read_to_string, remove_file};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Config;

pub const DEVMETA_KEY_PH_STATE: &str = "pantahub.state";
pub const DEVMETA_KEY_ONLINE: &str = "pantahub.online";
pub const DEVMETA_KEY_CLAIMED: &str = "pantahub.claimed";

#[derive(Debug, Clone, PartialEq, Eq)]
struct MetaItem {
    value: String,
    /// For user metadata: seen in the latest sync, set even when the
    /// value is unchanged so a stable entry can never be collected as
    /// stale. For device metadata: needs uploading.
    updated: bool,
}

#[derive(Debug)]
pub struct MetadataStore {
    usermeta: BTreeMap<String, MetaItem>,
    devmeta: BTreeMap<String, MetaItem>,
    devmeta_uploaded: bool,
    /// Hint-file root, `/pv` in production.
    pv_dir: PathBuf,
    /// Persistent user-metadata mirror on storage, if configured.
    cache_dir: Option<PathBuf>,
}

type DevmetaReader = fn() -> Option<String>;

fn read_arch() -> Option<String> {
    let endian = if cfg!(target_endian = "little") {
        "EL"
    } else {
        "EB"
    };
    Some(format!(
        "{}/{}/{}",
        std::env::consts::ARCH,
        std::mem::size_of::<usize>() * 8,
        endian
    ))
}

fn read_version() -> Option<String> {
    Some(env!("CARGO_PKG_VERSION").to_string())
}

fn read_dtmodel() -> Option<String> {
    read_to_string("/proc/device-tree/model")
        .ok()
        .map(|s| s.trim_end_matches('\0').trim().to_string())
}

fn read_cpumodel() -> Option<String> {
    let cpuinfo = read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo
        .lines()
        .find(|l| l.starts_with("model name") || l.starts_with("Hardware"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim().to_string())
}

lazy_static! {
    static ref DEVMETA_READERS: Vec<(&'static str, DevmetaReader)> = vec![
        ("pantavisor.arch", read_arch as DevmetaReader),
        ("pantavisor.version", read_version),
        ("pantavisor.dtmodel", read_dtmodel),
        ("pantavisor.cpumodel", read_cpumodel),
    ];
}

impl MetadataStore {
    pub fn new(pv_dir: &Path, cache_dir: Option<&Path>) -> Self {
        Self {
            usermeta: BTreeMap::new(),
            devmeta: BTreeMap::new(),
            devmeta_uploaded: false,
            pv_dir: pv_dir.to_path_buf(),
            cache_dir: cache_dir.map(Path::to_path_buf),
        }
    }

    /// Seed device metadata from the reader registry plus the
    /// controller-known facts.
    pub fn init_devmeta(&mut self, rev: &str, remote_mode: bool) {
        for (key, reader) in DEVMETA_READERS.iter() {
            if let Some(value) = reader() {
                self.add_devmeta(key, &value);
            }
        }
        self.add_devmeta("pantavisor.revision", rev);
        self.add_devmeta(
            "pantavisor.mode",
            if remote_mode { "remote" } else { "local" },
        );
        self.devmeta_uploaded = false;
    }

    /// Insert or update a device metadata pair. An insert or value change
    /// dirties the upload flag; re-adding an unchanged value is a no-op,
    /// so a clean upload state stays clean.
    pub fn add_devmeta(&mut self, key: &str, value: &str) {
        match self.devmeta.get_mut(key) {
            Some(item) if item.value == value => {}
            Some(item) => {
                item.value = value.to_string();
                item.updated = true;
                self.devmeta_uploaded = false;
                debug!("device metadata key {} updated", key);
            }
            None => {
                self.devmeta.insert(
                    key.to_string(),
                    MetaItem {
                        value: value.to_string(),
                        updated: true,
                    },
                );
                self.devmeta_uploaded = false;
                debug!("device metadata key {} added", key);
            }
        }
    }

    pub fn devmeta_get(&self, key: &str) -> Option<&str> {
        self.devmeta.get(key).map(|i| i.value.as_str())
    }

    pub fn usermeta_get(&self, key: &str) -> Option<&str> {
        self.usermeta.get(key).map(|i| i.value.as_str())
    }

    /// Serialise the dirty device metadata as one JSON object, or `None`
    /// when the last upload is still clean. Values that are themselves
    /// JSON objects are embedded unquoted.
    pub fn devmeta_payload(&self) -> Option<String> {
        if self.devmeta_uploaded {
            return None;
        }
        let mut map = Map::new();
        for (key, item) in &self.devmeta {
            if !item.updated {
                continue;
            }
            map.insert(key.clone(), json_or_string(&item.value));
        }
        if map.is_empty() {
            return None;
        }
        Some(Value::Object(map).to_string())
    }

    /// The upload succeeded: all flags clean.
    pub fn mark_devmeta_uploaded(&mut self) {
        for item in self.devmeta.values_mut() {
            item.updated = false;
        }
        self.devmeta_uploaded = true;
    }

    pub fn devmeta_uploaded(&self) -> bool {
        self.devmeta_uploaded
    }

    /// Walk the `user-meta` object of a device document: upsert every
    /// pair, then collect entries the cloud no longer carries.
    pub fn parse_usermeta(&mut self, device_body: &str, config: &mut Config) -> Result<()> {
        let root: Value =
            serde_json::from_str(device_body).context("parsing device document")?;
        let meta = root
            .get("user-meta")
            .ok_or_else(|| anyhow!("device document has no user-meta"))?;
        let meta = meta
            .as_object()
            .ok_or_else(|| anyhow!("user-meta is not an object"))?;

        for (key, value) in meta {
            let value = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            self.add_usermeta(key, &value, config);
        }
        self.clear_stale();
        Ok(())
    }

    fn add_usermeta(&mut self, key: &str, value: &str, config: &mut Config) {
        let changed = match self.usermeta.get_mut(key) {
            Some(item) if item.value == value => {
                item.updated = true;
                false
            }
            Some(item) => {
                item.value = value.to_string();
                item.updated = true;
                true
            }
            None => {
                self.usermeta.insert(
                    key.to_string(),
                    MetaItem {
                        value: value.to_string(),
                        updated: true,
                    },
                );
                true
            }
        };
        if changed {
            debug!("user metadata key {} added or updated", key);
            config.override_value(key, value);
            self.write_usermeta_files(key, value);
        }
    }

    /// Drop entries not marked in this sync cycle and reset the marks of
    /// the survivors for the next one.
    pub fn clear_stale(&mut self) {
        let keys: Vec<String> = self.usermeta.keys().cloned().collect();
        for key in keys {
            let updated = self.usermeta.get(&key).map(|i| i.updated).unwrap_or(false);
            if updated {
                if let Some(item) = self.usermeta.get_mut(&key) {
                    item.updated = false;
                }
            } else {
                self.usermeta.remove(&key);
                self.remove_usermeta_files(&key);
                debug!("user metadata key {} no longer in cloud, removed", key);
            }
        }
    }

    /// Reload user metadata persisted by an earlier boot so consumers see
    /// it before the first sync.
    pub fn load_cached_usermeta(&mut self, config: &mut Config) {
        let cache_dir = match &self.cache_dir {
            Some(d) => d.clone(),
            None => return,
        };
        let entries = match read_dir(&cache_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let key = match name.to_str() {
                Some(k) => k,
                None => continue,
            };
            if let Ok(value) = read_to_string(entry.path()) {
                self.add_usermeta(key, &value, config);
            }
        }
    }

    fn hint_path(&self, key: &str) -> PathBuf {
        self.pv_dir.join("user-meta").join(key)
    }

    fn write_usermeta_files(&self, key: &str, value: &str) {
        let hint = self.hint_path(key);
        if let Some(dir) = hint.parent() {
            let _ = create_dir_all(dir);
        }
        if let Err(e) = std::fs::write(&hint, value) {
            warn!("could not write hint {}: {}", hint.display(), e);
        }
        if let Some(cache_dir) = &self.cache_dir {
            let _ = create_dir_all(cache_dir);
            if let Err(e) = std::fs::write(cache_dir.join(key), value) {
                warn!("could not mirror user metadata {}: {}", key, e);
            }
        }
    }

    fn remove_usermeta_files(&self, key: &str) {
        let _ = remove_file(self.hint_path(key));
        if let Some(cache_dir) = &self.cache_dir {
            let _ = remove_file(cache_dir.join(key));
        }
    }
}

/// Detect values that are JSON documents themselves (leading `{`) so the
/// upload serialiser can embed them without quoting.
fn json_or_string(value: &str) -> Value {
    if value.trim_start().starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<Value>(value) {
            return parsed;
        }
    }
    Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use tempfile::TempDir;

    fn store() -> (TempDir, TempDir, MetadataStore) {
        let pv = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let store = MetadataStore::new(pv.path(), Some(cache.path()));
        (pv, cache, store)
    }

    fn device_body(meta: &BTreeMap<&str, &str>) -> String {
        let mut obj = Map::new();
        for (k, v) in meta {
            obj.insert(k.to_string(), Value::String(v.to_string()));
        }
        serde_json::json!({ "id": "dev1", "user-meta": obj }).to_string()
    }

    #[test]
    fn test_usermeta_sync_and_hints() {
        let (pv, _cache, mut store) = store();
        let mut config = Config::default();

        let body = device_body(&btreemap! {"ssh.keys" => "key1", "location" => "lab"});
        store.parse_usermeta(&body, &mut config).unwrap();
        assert_eq!(store.usermeta_get("ssh.keys"), Some("key1"));
        assert_eq!(
            read_to_string(pv.path().join("user-meta/ssh.keys")).unwrap(),
            "key1"
        );

        // next cycle drops one key, the hint file goes with it
        let body = device_body(&btreemap! {"ssh.keys" => "key1"});
        store.parse_usermeta(&body, &mut config).unwrap();
        assert_eq!(store.usermeta_get("location"), None);
        assert!(!pv.path().join("user-meta/location").exists());
        assert!(pv.path().join("user-meta/ssh.keys").exists());
    }

    #[test]
    fn test_stable_entry_survives_cycles() {
        let (_pv, _cache, mut store) = store();
        let mut config = Config::default();
        let body = device_body(&btreemap! {"stable" => "same"});

        // the value never changes, but re-announcing it each cycle keeps
        // it alive
        for _ in 0..3 {
            store.parse_usermeta(&body, &mut config).unwrap();
            assert_eq!(store.usermeta_get("stable"), Some("same"));
        }
    }

    #[test]
    fn test_usermeta_overrides_config() {
        let (_pv, _cache, mut store) = store();
        let mut config = Config::default();
        let body = device_body(&btreemap! {"updater.interval" => "15"});
        store.parse_usermeta(&body, &mut config).unwrap();
        assert_eq!(config.updater.interval, 15);
    }

    #[test]
    fn test_cached_usermeta_reload() {
        let (_pv, cache, mut store) = store();
        let mut config = Config::default();
        std::fs::write(cache.path().join("greeting"), "hello").unwrap();
        store.load_cached_usermeta(&mut config);
        assert_eq!(store.usermeta_get("greeting"), Some("hello"));
    }

    #[test]
    fn test_devmeta_upload_flow() {
        let (_pv, _cache, mut store) = store();
        store.add_devmeta("pantavisor.arch", "x86_64/64/EL");
        store.add_devmeta(DEVMETA_KEY_PH_STATE, "idle");

        let payload = store.devmeta_payload().unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["pantavisor.arch"], "x86_64/64/EL");
        assert_eq!(value[DEVMETA_KEY_PH_STATE], "idle");

        store.mark_devmeta_uploaded();
        assert!(store.devmeta_uploaded());
        assert_eq!(store.devmeta_payload(), None);

        // unchanged re-add does not dirty the upload flag
        store.add_devmeta(DEVMETA_KEY_PH_STATE, "idle");
        assert!(store.devmeta_uploaded());

        // a change does
        store.add_devmeta(DEVMETA_KEY_PH_STATE, "update");
        assert!(!store.devmeta_uploaded());
        let payload = store.devmeta_payload().unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        // only the dirty pair is uploaded
        assert_eq!(value[DEVMETA_KEY_PH_STATE], "update");
        assert!(value.get("pantavisor.arch").is_none());
    }

    #[test]
    fn test_json_values_embedded_unquoted() {
        let (_pv, _cache, mut store) = store();
        store.add_devmeta("interfaces", r#"{"eth0":"10.0.0.2"}"#);
        let payload = store.devmeta_payload().unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["interfaces"]["eth0"], "10.0.0.2");

        // a brace-leading string that is not valid JSON stays a string
        store.add_devmeta("odd", "{not json");
        let value: Value =
            serde_json::from_str(&store.devmeta_payload().unwrap()).unwrap();
        assert_eq!(value["odd"], "{not json");
    }

    #[test]
    fn test_init_devmeta_seeds_registry() {
        let (_pv, _cache, mut store) = store();
        store.init_devmeta("10", true);
        assert!(store.devmeta_get("pantavisor.arch").is_some());
        assert_eq!(
            store.devmeta_get("pantavisor.version"),
            Some(env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(store.devmeta_get("pantavisor.revision"), Some("10"));
        assert_eq!(store.devmeta_get("pantavisor.mode"), Some("remote"));
    }
}
