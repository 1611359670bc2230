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

//! In-memory form of a revision's state JSON, and the registry of spec
//! parsers that produce it.

mod multi1;
mod system1;

use anyhow::{anyhow, bail, Context, Result};
use openssl::sha::Sha256;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

pub const SPEC_MULTI1: &str = "pantavisor-multi-platform@1";
pub const SPEC_SYSTEM1: &str = "pantavisor-service-system@1";

/// Namespaces a platform may share with the host.
pub const NS_NETWORK: u32 = 1 << 0;
pub const NS_UTS: u32 = 1 << 1;
pub const NS_IPC: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    Multi1,
    System1,
}

impl SpecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Multi1 => SPEC_MULTI1,
            Self::System1 => SPEC_SYSTEM1,
        }
    }

    /// Path prefix under the revision root where BSP assets live.
    pub fn bsp_prefix(&self) -> &'static str {
        match self {
            Self::Multi1 => "",
            Self::System1 => "bsp/",
        }
    }
}

impl FromStr for SpecKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            SPEC_MULTI1 => Ok(Self::Multi1),
            SPEC_SYSTEM1 => Ok(Self::System1),
            _ => bail!("spec '{}' not supported", s),
        }
    }
}

/// How disruptive a change is; smaller values affect deeper layers.
/// Platforms without an explicit runlevel get `Data`, the most
/// conservative choice (forces the reboot path on update).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Runlevel {
    Data = 0,
    Root = 1,
    Platform = 2,
    App = 3,
}

impl FromStr for Runlevel {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data" => Ok(Self::Data),
            "root" => Ok(Self::Root),
            "platform" => Ok(Self::Platform),
            "app" => Ok(Self::App),
            _ => bail!("unknown runlevel '{}'", s),
        }
    }
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "data",
            Self::Root => "root",
            Self::Platform => "platform",
            Self::App => "app",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bsp {
    pub kernel: String,
    pub initrd: String,
    pub fdt: Option<String>,
    pub firmware: Option<String>,
    pub modules: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub name: String,
    pub typ: String,
    pub exec: String,
    pub configs: Vec<String>,
    pub ns_share: u32,
    pub runlevel: Runlevel,
    /// Raw definition blob, kept for the container runtime.
    pub json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    LoopImg,
    Permanent,
    Revision,
    Boot,
}

impl VolumeType {
    fn from_modifier(name: &str) -> Self {
        // volume names may carry a `---` modifier suffix
        match name.rsplit("---").next() {
            Some("permanent") => Self::Permanent,
            Some("revision") => Self::Revision,
            Some("boot") => Self::Boot,
            _ => Self::LoopImg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub typ: VolumeType,
    /// Owning platform, when declared inside a platform definition.
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub rev: String,
    pub spec: SpecKind,
    pub bsp: Bsp,
    pub platforms: Vec<Platform>,
    pub volumes: Vec<Volume>,
    pub addons: Vec<String>,
    /// Relative path under the revision root -> hex SHA-256 object id.
    pub objects: BTreeMap<String, String>,
    /// Canonical unparsed bytes, retained for signature verification and
    /// re-serialisation.
    pub json: String,
    /// Introduced locally, bypassing the hub.
    pub local: bool,
}

type ParserFn = fn(&Value, &str, &str) -> Result<State>;

fn parsers() -> &'static [(SpecKind, ParserFn)] {
    &[
        (SpecKind::Multi1, multi1::parse),
        (SpecKind::System1, system1::parse),
    ]
}

impl State {
    /// Parse canonical state JSON into a `State`, dispatching on the
    /// `#spec` field.
    pub fn parse(json: &str, rev: &str) -> Result<State> {
        let root: Value = serde_json::from_str(json).context("parsing state json")?;
        let spec = root
            .get("#spec")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("state json has no #spec field"))?;
        let kind = SpecKind::from_str(spec)?;
        let parse = parsers()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, f)| *f)
            .ok_or_else(|| anyhow!("no parser registered for '{}'", spec))?;
        let mut state = parse(&root, json, rev)?;
        state.local = crate::storage::is_revision_local(rev);
        state.validate()?;
        Ok(state)
    }

    /// Top-level keys ending `.json`, which the revision store
    /// materialises as files under the revision root.
    pub fn inline_files(&self) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&self.json) {
            for key in map.keys() {
                if key.ends_with(".json") {
                    files.insert(key.clone());
                }
            }
        }
        files
    }

    /// Check internal consistency: every referenced path resolves to an
    /// object or an inline JSON child, and platform/volume references
    /// line up.
    fn validate(&self) -> Result<()> {
        let inline = self.inline_files();
        let known = |path: &str| self.objects.contains_key(path) || inline.contains(path);
        let prefix = self.spec.bsp_prefix();

        for path in [Some(&self.bsp.kernel), Some(&self.bsp.initrd)]
            .into_iter()
            .flatten()
        {
            let full = format!("{}{}", prefix, path);
            if !known(&full) {
                bail!("bsp asset '{}' not present in state", full);
            }
        }
        for path in [&self.bsp.fdt, &self.bsp.firmware, &self.bsp.modules]
            .into_iter()
            .flatten()
        {
            let full = format!("{}{}", prefix, path);
            if !known(&full) {
                bail!("bsp asset '{}' not present in state", full);
            }
        }
        for addon in &self.addons {
            let full = format!("{}{}", prefix, addon);
            if !known(&full) {
                bail!("addon '{}' not present in state", full);
            }
        }
        for platform in &self.platforms {
            for config in &platform.configs {
                let full = match self.spec {
                    SpecKind::Multi1 => config.clone(),
                    SpecKind::System1 => format!("{}/{}", platform.name, config),
                };
                if !known(&full) {
                    bail!(
                        "config '{}' of platform '{}' not present in state",
                        full,
                        platform.name
                    );
                }
            }
        }
        for volume in &self.volumes {
            // only image-backed volumes need a payload on disk
            if volume.typ != VolumeType::LoopImg {
                continue;
            }
            let full = match &volume.platform {
                Some(p) => format!("{}/{}", p, volume.name),
                None => volume.name.clone(),
            };
            if !known(&full) {
                bail!("volume '{}' not present in state", full);
            }
        }
        Ok(())
    }

    /// Re-hash every object referenced by the state against the revision
    /// tree on disk.
    pub fn validate_checksums(&self, rev_dir: &Path) -> Result<()> {
        for (path, id) in &self.objects {
            let file = rev_dir.join(path);
            validate_file_checksum(&file, id)
                .with_context(|| format!("validating {}", file.display()))?;
        }
        Ok(())
    }

    /// Smallest runlevel among platforms whose name is in `affected`.
    pub fn min_runlevel<'a, I: IntoIterator<Item = &'a str>>(&self, affected: I) -> Runlevel {
        let names: BTreeSet<&str> = affected.into_iter().collect();
        self.platforms
            .iter()
            .filter(|p| names.contains(p.name.as_str()))
            .map(|p| p.runlevel)
            .min()
            .unwrap_or(Runlevel::App)
    }

    pub fn platforms_at_or_above(&self, runlevel: Runlevel) -> Vec<&Platform> {
        self.platforms
            .iter()
            .filter(|p| p.runlevel >= runlevel)
            .collect()
    }
}

/// Hash a file on disk and compare against a hex digest.
pub fn validate_file_checksum(path: &Path, id: &str) -> Result<()> {
    let expected = hex::decode(id).with_context(|| format!("decoding digest '{}'", id))?;
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; crate::objects::BUFFER_SIZE];
    loop {
        let count = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading file"),
        };
        hasher.update(&buf[..count]);
    }
    let computed = hasher.finish();
    if computed[..] != expected[..] {
        bail!(
            "sha256 mismatch: expected {}, found {}",
            id,
            hex::encode(computed)
        );
    }
    Ok(())
}

pub(crate) fn ns_share_flag(name: &str) -> u32 {
    match name {
        "NETWORK" => NS_NETWORK,
        "UTS" => NS_UTS,
        "IPC" => NS_IPC,
        _ => 0,
    }
}

/// Pull the array of strings at `key`, tolerating its absence.
pub(crate) fn str_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_roundtrip() {
        for spec in [SPEC_MULTI1, SPEC_SYSTEM1] {
            assert_eq!(SpecKind::from_str(spec).unwrap().as_str(), spec);
        }
        SpecKind::from_str("pantavisor-other@9").unwrap_err();
    }

    #[test]
    fn test_runlevel_order() {
        assert!(Runlevel::Data < Runlevel::Root);
        assert!(Runlevel::Root < Runlevel::Platform);
        assert!(Runlevel::Platform < Runlevel::App);
        assert_eq!("app".parse::<Runlevel>().unwrap(), Runlevel::App);
        "kernel".parse::<Runlevel>().unwrap_err();
    }

    #[test]
    fn test_validate_file_checksum() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"abc").unwrap();
        let id = crate::objects::sha256_hex(b"abc");
        validate_file_checksum(&path, &id).unwrap();
        validate_file_checksum(&path, &crate::objects::sha256_hex(b"abd")).unwrap_err();
    }

    #[test]
    fn test_unknown_spec_rejected() {
        let json = r##"{"#spec": "pantavisor-unknown@1"}"##;
        State::parse(json, "5").unwrap_err();
    }
}
