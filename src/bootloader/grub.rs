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

//! GRUB environment block back-end: a fixed 1024-byte file with a magic
//! header and `#` padding, the format `grub-editenv` understands.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, read_to_string, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::EnvBackend;

const GRUBENV_SIZE: usize = 1024;
const GRUBENV_HEADER: &str = "# GRUB Environment Block\n";

#[derive(Debug)]
pub struct GrubEnv {
    path: PathBuf,
    vars: BTreeMap<String, String>,
}

impl GrubEnv {
    pub fn load(path: &Path) -> Result<Self> {
        let vars = match read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .with_context(|| format!("parsing {}", path.display()))?,
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
        let payload = match content.strip_prefix(GRUBENV_HEADER) {
            Some(p) => p,
            None => bail!("missing GRUB environment block header"),
        };
        let mut vars = BTreeMap::new();
        for line in payload.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(key.to_string(), value.to_string());
            }
        }
        Ok(vars)
    }

    fn render(&self) -> Result<Vec<u8>> {
        let mut out = String::from(GRUBENV_HEADER);
        for (key, value) in &self.vars {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        if out.len() > GRUBENV_SIZE {
            bail!(
                "environment block overflow: {} bytes of {}",
                out.len(),
                GRUBENV_SIZE
            );
        }
        let mut bytes = out.into_bytes();
        bytes.resize(GRUBENV_SIZE, b'#');
        Ok(bytes)
    }
}

impl EnvBackend for GrubEnv {
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
        let content = self.render()?;
        let dir = self
            .path
            .parent()
            .context("environment path has no parent directory")?;
        create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(&content).context("writing environment block")?;
        tmp.as_file().sync_all().context("syncing environment block")?;
        tmp.persist(&self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("syncing {}", dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_block_is_fixed_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grubenv");
        let mut env = GrubEnv::load(&path).unwrap();
        env.set("pv_rev", "10");
        env.set("pv_try", "11");
        env.flush().unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), GRUBENV_SIZE);
        assert!(content.starts_with(GRUBENV_HEADER.as_bytes()));
        assert!(content.ends_with(b"#"));
    }

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grubenv");
        let mut env = GrubEnv::load(&path).unwrap();
        env.set("pv_rev", "10");
        env.set("pv_boot_rollback", "1");
        env.flush().unwrap();

        let env = GrubEnv::load(&path).unwrap();
        assert_eq!(env.get("pv_rev"), Some("10"));
        assert_eq!(env.get("pv_boot_rollback"), Some("1"));
        assert_eq!(env.get("pv_try"), None);
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grubenv");
        std::fs::write(&path, "not a grub env").unwrap();
        GrubEnv::load(&path).unwrap_err();
    }

    #[test]
    fn test_overflow_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grubenv");
        let mut env = GrubEnv::load(&path).unwrap();
        env.set("pv_try", &"x".repeat(2048));
        env.flush().unwrap_err();
    }
}
