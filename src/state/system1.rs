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

//! Parser for the structured `pantavisor-service-system@1` state format:
//! the BSP manifest lives at `bsp/run.json`, each platform is a
//! `<name>/run.json` entry carrying its own volumes and runlevel.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::{ns_share_flag, str_array, Bsp, Platform, Runlevel, SpecKind, State, Volume, VolumeType};

pub(super) fn parse(root: &Value, json: &str, rev: &str) -> Result<State> {
    let map = root
        .as_object()
        .ok_or_else(|| anyhow!("state json is not an object"))?;

    let manifest = map
        .get("bsp/run.json")
        .ok_or_else(|| anyhow!("state has no bsp/run.json entry"))?;
    let field = |key: &str| manifest.get(key).and_then(Value::as_str).map(str::to_string);
    let bsp = Bsp {
        kernel: field("linux").context("bsp manifest has no linux entry")?,
        initrd: field("initrd").context("bsp manifest has no initrd entry")?,
        fdt: field("fdt"),
        firmware: field("firmware"),
        modules: field("modules"),
    };
    let addons = str_array(manifest, "addons");

    let mut platforms = Vec::new();
    let mut volumes = Vec::new();
    let mut objects = BTreeMap::new();
    for (key, value) in map {
        if key == "#spec" || key == "bsp/run.json" {
            continue;
        }
        if let Some(name) = platform_name(key) {
            match parse_platform(name, value) {
                Some((platform, mut vols)) => {
                    platforms.push(platform);
                    volumes.append(&mut vols);
                }
                None => debug!("dropping incomplete platform entry '{}'", key),
            }
            continue;
        }
        if let Some(id) = value.as_str() {
            objects.insert(key.clone(), id.to_string());
        }
    }

    Ok(State {
        rev: rev.to_string(),
        spec: SpecKind::System1,
        bsp,
        platforms,
        volumes,
        addons,
        objects,
        json: json.to_string(),
        local: false,
    })
}

/// `<name>/run.json` defines the platform `<name>`.
fn platform_name(key: &str) -> Option<&str> {
    let (name, rest) = key.split_once('/')?;
    if rest == "run.json" && !name.is_empty() {
        Some(name)
    } else {
        None
    }
}

fn parse_platform(name: &str, value: &Value) -> Option<(Platform, Vec<Volume>)> {
    let typ = value.get("type").and_then(Value::as_str)?.to_string();
    let exec = value.get("exec").and_then(Value::as_str)?.to_string();

    // a single `config` entry or a `configs` array
    let mut configs = str_array(value, "configs");
    if let Some(config) = value.get("config").and_then(Value::as_str) {
        configs.push(config.to_string());
    }
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

    let mut volumes = Vec::new();
    if let Some(root_volume) = value.get("root-volume").and_then(Value::as_str) {
        volumes.push(Volume {
            name: root_volume.to_string(),
            typ: VolumeType::from_modifier(root_volume),
            platform: Some(name.to_string()),
        });
    }
    for vol in str_array(value, "volumes") {
        volumes.push(Volume {
            typ: VolumeType::from_modifier(&vol),
            name: vol,
            platform: Some(name.to_string()),
        });
    }

    Some((
        Platform {
            name: name.to_string(),
            typ,
            exec,
            configs,
            ns_share,
            runlevel,
            json: value.to_string(),
        },
        volumes,
    ))
}

#[cfg(test)]
mod tests {
    use super::super::{State, NS_NETWORK};
    use super::*;

    fn sample_json() -> String {
        let kernel_id = crate::objects::sha256_hex(b"kernel");
        let initrd_id = crate::objects::sha256_hex(b"initrd");
        let fdt_id = crate::objects::sha256_hex(b"fdt");
        let root_id = crate::objects::sha256_hex(b"rootfs");
        let config_id = crate::objects::sha256_hex(b"lxc config");
        format!(
            r##"{{
  "#spec": "pantavisor-service-system@1",
  "bsp/run.json": {{
    "linux": "kernel.img",
    "initrd": "initrd.img",
    "fdt": "board.dtb",
    "addons": []
  }},
  "bsp/kernel.img": "{kernel_id}",
  "bsp/initrd.img": "{initrd_id}",
  "bsp/board.dtb": "{fdt_id}",
  "awconnect/run.json": {{
    "type": "lxc",
    "exec": "/sbin/init",
    "config": "lxc.container.conf",
    "root-volume": "root.squashfs",
    "volumes": ["data---permanent"],
    "share": ["NETWORK"],
    "runlevel": "platform"
  }},
  "awconnect/lxc.container.conf": "{config_id}",
  "awconnect/root.squashfs": "{root_id}"
}}"##
        )
    }

    #[test]
    fn test_parse_system1() {
        let json = sample_json();
        let state = State::parse(&json, "11").unwrap();

        assert_eq!(state.spec, SpecKind::System1);
        assert_eq!(state.spec.bsp_prefix(), "bsp/");
        assert_eq!(state.bsp.kernel, "kernel.img");
        assert_eq!(state.bsp.fdt.as_deref(), Some("board.dtb"));

        assert_eq!(state.platforms.len(), 1);
        let platform = &state.platforms[0];
        assert_eq!(platform.name, "awconnect");
        assert_eq!(platform.configs, vec!["lxc.container.conf"]);
        assert_eq!(platform.ns_share, NS_NETWORK);
        assert_eq!(platform.runlevel, Runlevel::Platform);

        assert_eq!(state.volumes.len(), 2);
        assert_eq!(state.volumes[0].name, "root.squashfs");
        assert_eq!(state.volumes[0].platform.as_deref(), Some("awconnect"));
        assert_eq!(state.volumes[0].typ, VolumeType::LoopImg);
        assert_eq!(state.volumes[1].typ, VolumeType::Permanent);

        assert_eq!(state.objects.len(), 5);
    }

    #[test]
    fn test_roundtrip() {
        let json = sample_json();
        let state = State::parse(&json, "11").unwrap();
        let again = State::parse(&state.json, "11").unwrap();
        assert_eq!(state, again);
    }

    #[test]
    fn test_platform_without_exec_dropped() {
        let kernel_id = crate::objects::sha256_hex(b"kernel");
        let initrd_id = crate::objects::sha256_hex(b"initrd");
        let json = format!(
            r##"{{
  "#spec": "pantavisor-service-system@1",
  "bsp/run.json": {{"linux": "kernel.img", "initrd": "initrd.img"}},
  "bsp/kernel.img": "{kernel_id}",
  "bsp/initrd.img": "{initrd_id}",
  "broken/run.json": {{"type": "lxc"}}
}}"##
        );
        let state = State::parse(&json, "12").unwrap();
        assert!(state.platforms.is_empty());
    }

    #[test]
    fn test_platform_name() {
        assert_eq!(platform_name("alpine/run.json"), Some("alpine"));
        assert_eq!(platform_name("alpine/other.json"), None);
        assert_eq!(platform_name("run.json"), None);
        assert_eq!(platform_name("/run.json"), None);
    }

    #[test]
    fn test_min_runlevel() {
        let json = sample_json();
        let state = State::parse(&json, "11").unwrap();
        assert_eq!(state.min_runlevel(["awconnect"]), Runlevel::Platform);
        // no affected platforms: least disruptive level
        assert_eq!(state.min_runlevel(std::iter::empty()), Runlevel::App);
    }
}
