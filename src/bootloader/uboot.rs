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

//! U-Boot environment back-ends: a plain `uboot.txt` key=value file, and
//! the PVK variant that wraps the same payload in a checksummed envelope
//! so the firmware can reject torn or tampered writes.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, read_to_string, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::EnvBackend;
use crate::objects::sha256_hex;

fn parse_env(content: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            vars.insert(key.to_string(), value.to_string());
        }
    }
    vars
}

fn render_env(vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in vars {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Write a file atomically and durably: temp file in the same directory,
/// fsync, rename, fsync the directory.
fn write_durable(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .context("environment path has no parent directory")?;
    create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(content).context("writing environment")?;
    tmp.as_file().sync_all().context("syncing environment")?;
    tmp.persist(path)
        .with_context(|| format!("renaming environment into {}", path.display()))?;
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("syncing {}", dir.display()))?;
    Ok(())
}

#[derive(Debug)]
pub struct UbootEnv {
    path: PathBuf,
    vars: BTreeMap<String, String>,
}

impl UbootEnv {
    pub fn load(path: &Path) -> Result<Self> {
        let vars = match read_to_string(path) {
            Ok(content) => parse_env(&content),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            vars,
        })
    }
}

impl EnvBackend for UbootEnv {
    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }

    fn flush(&mut self) -> Result<()> {
        write_durable(&self.path, render_env(&self.vars).as_bytes())
    }
}

const PVK_MAGIC: &str = "PVK1";

/// Same variables as the plain back-end, preceded by a header line
/// `PVK1 <sha256 of payload>`. A payload that does not match its digest
/// is treated as absent, which makes a torn write equivalent to an empty
/// environment rather than a corrupt one.
#[derive(Debug)]
pub struct PvkEnv {
    path: PathBuf,
    vars: BTreeMap<String, String>,
}

impl PvkEnv {
    pub fn load(path: &Path) -> Result<Self> {
        let vars = match read_to_string(path) {
            Ok(content) => Self::parse(&content)?,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            vars,
        })
    }

    fn parse(content: &str) -> Result<BTreeMap<String, String>> {
        let (header, payload) = match content.split_once('\n') {
            Some(parts) => parts,
            None => bail!("envelope has no header line"),
        };
        let digest = match header.split_once(' ') {
            Some((magic, digest)) if magic == PVK_MAGIC => digest,
            _ => bail!("bad envelope magic"),
        };
        if digest != sha256_hex(payload.as_bytes()) {
            bail!("envelope digest mismatch");
        }
        Ok(parse_env(payload))
    }
}

impl EnvBackend for PvkEnv {
    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }

    fn flush(&mut self) -> Result<()> {
        let payload = render_env(&self.vars);
        let content = format!("{} {}\n{}", PVK_MAGIC, sha256_hex(payload.as_bytes()), payload);
        write_durable(&self.path, content.as_bytes())
    }
}
