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

//! Parser for the flat `pantavisor-multi-platform@1` state format: the
//! top-level `pantavisor.json` key holds the BSP manifest, keys ending
//! `.json` define platforms, and the remaining string keys map file
//! paths to object ids.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{ns_share_flag, str_array, Bsp, Platform, Runlevel, SpecKind, State, Volume, VolumeType};

pub(super) fn parse(root: &Value, json: &str, rev: &str) -> Result<State> {
    let map = root
        .as_object()
        .ok_or_else(|| anyhow!("state json is not an object"))?;

    let manifest = map
        .get("pantavisor.json")
        .ok_or_else(|| anyhow!("state has no pantavisor.json entry"))?;

    let bsp = parse_manifest(manifest)?;
    let addons = str_array(manifest, "addons");
    let declared_platforms = str_array(manifest, "platforms");
    let volumes: Vec<Volume> = str_array(manifest, "volumes")
        .into_iter()
        .map(|name| Volume {
            typ: VolumeType::from_modifier(&name),
            name,
            platform: None,
        })
        .collect();

    let mut platforms = Vec::new();
    let mut objects = BTreeMap::new();
    for (key, value) in map {
        if key == "#spec" || key == "pantavisor.json" {
            continue;
        }
        if key.ends_with(".json") {
            match parse_platform(key, value, &declared_platforms) {
                Some(platform) => platforms.push(platform),
                None => debug!("dropping incomplete platform entry '{}'", key),
            }
            continue;
        }
        match value.as_str() {
            Some(id) => {
                objects.insert(key.clone(), id.to_string());
            }
            None => warn!("ignoring non-string state entry '{}'", key),
        }
    }

    // keep declaration order from the manifest
    platforms.sort_by_key(|p: &Platform| {
        declared_platforms
            .iter()
            .position(|n| n == &p.name)
            .unwrap_or(usize::MAX)
    });

    Ok(State {
        rev: rev.to_string(),
        spec: SpecKind::Multi1,
        bsp,
        platforms,
        volumes,
        addons,
        objects,
        json: json.to_string(),
        local: false,
    })
}

fn parse_manifest(manifest: &Value) -> Result<Bsp> {
    let field = |key: &str| manifest.get(key).and_then(Value::as_str).map(str::to_string);
    Ok(Bsp {
        kernel: field("linux").context("manifest has no linux entry")?,
        initrd: field("initrd").context("manifest has no initrd entry")?,
        fdt: field("fdt"),
        firmware: field("firmware"),
        modules: field("modules"),
    })
}

/// Build one platform from its definition blob. Returns `None` when a
/// required field is missing or the platform was never declared in the
/// manifest.
fn parse_platform(key: &str, value: &Value, declared: &[String]) -> Option<Platform> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| key.trim_end_matches(".json").to_string());
    if !declared.iter().any(|n| n == &name) {
        warn!("platform '{}' not declared in pantavisor.json", name);
        return None;
    }

    let typ = value.get("type").and_then(Value::as_str)?.to_string();
    let exec = value.get("exec").and_then(Value::as_str)?.to_string();
    let configs = str_array(value, "configs");
    if configs.is_empty() {
        return None;
    }

    let ns_share = str_array(value, "share")
        .iter()
        .fold(0, |acc, s| acc | ns_share_flag(s));
    let runlevel = value
        .get("runlevel")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(Runlevel::Data);

    Some(Platform {
        name,
        typ,
        exec,
        configs,
        ns_share,
        runlevel,
        json: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{State, NS_IPC, NS_NETWORK};
    use super::*;

    pub(crate) fn sample_json() -> String {
        let kernel_id = crate::objects::sha256_hex(b"kernel");
        let initrd_id = crate::objects::sha256_hex(b"initrd");
        let volume_id = crate::objects::sha256_hex(b"volume");
        let config_id = crate::objects::sha256_hex(b"config");
        format!(
            r##"{{
  "#spec": "pantavisor-multi-platform@1",
  "pantavisor.json": {{
    "linux": "kernel.img",
    "initrd": "0base.cpio.gz",
    "platforms": ["alpine", "ghost"],
    "volumes": ["alpine-root.squashfs"],
    "addons": []
  }},
  "alpine.json": {{
    "name": "alpine",
    "type": "lxc",
    "exec": "/sbin/init",
    "configs": ["alpine.conf"],
    "share": ["NETWORK", "IPC"],
    "runlevel": "app"
  }},
  "ghost.json": {{
    "name": "ghost",
    "type": "lxc"
  }},
  "kernel.img": "{kernel_id}",
  "0base.cpio.gz": "{initrd_id}",
  "alpine-root.squashfs": "{volume_id}",
  "alpine.conf": "{config_id}"
}}"##
        )
    }

    #[test]
    fn test_parse_multi1() {
        let json = sample_json();
        let state = State::parse(&json, "10").unwrap();

        assert_eq!(state.rev, "10");
        assert_eq!(state.spec, SpecKind::Multi1);
        assert_eq!(state.bsp.kernel, "kernel.img");
        assert_eq!(state.bsp.initrd, "0base.cpio.gz");
        assert_eq!(state.bsp.fdt, None);

        // ghost has no exec/configs and must be dropped
        assert_eq!(state.platforms.len(), 1);
        let alpine = &state.platforms[0];
        assert_eq!(alpine.name, "alpine");
        assert_eq!(alpine.typ, "lxc");
        assert_eq!(alpine.exec, "/sbin/init");
        assert_eq!(alpine.configs, vec!["alpine.conf"]);
        assert_eq!(alpine.ns_share, NS_NETWORK | NS_IPC);
        assert_eq!(alpine.runlevel, Runlevel::App);

        assert_eq!(state.volumes.len(), 1);
        assert_eq!(state.volumes[0].name, "alpine-root.squashfs");
        assert_eq!(state.volumes[0].typ, VolumeType::LoopImg);

        assert_eq!(state.objects.len(), 4);
        assert!(state.objects.contains_key("kernel.img"));
        assert!(!state.local);
    }

    #[test]
    fn test_parse_serialize_roundtrip() {
        let json = sample_json();
        let state = State::parse(&json, "10").unwrap();
        // the canonical bytes are retained verbatim, so reparsing them
        // reproduces the state
        let again = State::parse(&state.json, "10").unwrap();
        assert_eq!(state, again);
    }

    #[test]
    fn test_missing_bsp_rejected() {
        let json = r##"{
  "#spec": "pantavisor-multi-platform@1",
  "pantavisor.json": {"initrd": "0base.cpio.gz", "platforms": [], "volumes": []}
}"##;
        State::parse(json, "3").unwrap_err();
    }

    #[test]
    fn test_unreferenced_object_path_rejected() {
        // manifest references a kernel that has no object entry
        let json = r##"{
  "#spec": "pantavisor-multi-platform@1",
  "pantavisor.json": {"linux": "kernel.img", "initrd": "0base.cpio.gz",
                      "platforms": [], "volumes": []}
}"##;
        State::parse(json, "3").unwrap_err();
    }

    #[test]
    fn test_local_revision_flag() {
        let json = sample_json();
        let state = State::parse(&json, "locals/dev1").unwrap();
        assert!(state.local);
    }
}
