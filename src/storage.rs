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

//! Per-revision trees under `<mnt>/trails/<rev>/`, the `current`
//! symlinks, progress/commit-message sidecars, and the garbage collector
//! over revisions and unreferenced objects.

use anyhow::{anyhow, bail, Context, Result};
use byte_unit::{Byte, UnitType};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use std::fs::{
    create_dir_all, read_dir, read_link, read_to_string, remove_dir_all, remove_file, File,
    OpenOptions,
};
use std::io::Write;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, GcConfig};
use crate::objects::ObjectStore;
use crate::state::State;

/// The factory revision is pinned by name.
pub const FACTORY_REV: &str = "0";

lazy_static! {
    static ref LOCAL_REV: Regex = Regex::new(r"^locals/[^/]+$").expect("compiling RE");
}

/// Local revisions live under the reserved `locals/` prefix with exactly
/// one path separator.
pub fn is_revision_local(rev: &str) -> bool {
    LOCAL_REV.is_match(rev)
}

#[derive(Debug, Clone)]
pub struct RevisionStore {
    mnt: PathBuf,
}

impl RevisionStore {
    pub fn new(mnt: &Path) -> Self {
        Self {
            mnt: mnt.to_path_buf(),
        }
    }

    pub fn mnt(&self) -> &Path {
        &self.mnt
    }

    pub fn trails_dir(&self) -> PathBuf {
        self.mnt.join("trails")
    }

    pub fn rev_dir(&self, rev: &str) -> PathBuf {
        self.trails_dir().join(rev)
    }

    pub fn logs_dir(&self, rev: &str) -> PathBuf {
        self.mnt.join("logs").join(rev)
    }

    fn disks_dir(&self, rev: &str) -> PathBuf {
        self.mnt.join("disks/rev").join(rev)
    }

    pub fn state_json_path(&self, rev: &str) -> PathBuf {
        self.rev_dir(rev).join(".pvr/json")
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in ["trails", "logs", "disks/rev", "config", "objects"] {
            let path = self.mnt.join(dir);
            create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
        }
        Ok(())
    }

    pub fn read_state_json(&self, rev: &str) -> Result<String> {
        let path = self.state_json_path(rev);
        read_to_string(&path).with_context(|| format!("reading state from {}", path.display()))
    }

    /// Write the canonical state JSON for a revision: temp file, fsync,
    /// rename.
    pub fn write_state(&self, rev: &str, json: &str) -> Result<()> {
        let path = self.state_json_path(rev);
        let dir = path.parent().expect(".pvr path has a parent");
        create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes()).context("writing state")?;
        tmp.as_file().sync_all().context("syncing state")?;
        tmp.persist(&path)
            .with_context(|| format!("renaming state into {}", path.display()))?;
        File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("syncing {}", dir.display()))?;
        Ok(())
    }

    /// Drop a pvr config sidecar pointing tooling at the shared object
    /// store. Kept as-is when already present.
    pub fn write_pvr_config(&self, rev: &str) -> Result<()> {
        let path = self.rev_dir(rev).join(".pvr/config");
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let body = json!({ "ObjectsDir": self.mnt.join("objects") });
        std::fs::write(&path, body.to_string())
            .with_context(|| format!("writing {}", path.display()))?;
        debug!("wrote ObjectsDir pvr config for rev {}", rev);
        Ok(())
    }

    /// Materialise every state key ending `.json` as a file under the
    /// revision root. Existing files are left untouched.
    pub fn expand_inline_jsons(&self, state: &State) -> Result<()> {
        let root: Value = serde_json::from_str(&state.json).context("parsing state json")?;
        let map = match root.as_object() {
            Some(m) => m,
            None => bail!("state json is not an object"),
        };
        for (key, value) in map {
            if !key.ends_with(".json") {
                continue;
            }
            let path = self.rev_dir(&state.rev).join(key);
            if path.exists() {
                continue;
            }
            if let Some(dir) = path.parent() {
                create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            file.write_all(value.to_string().as_bytes())
                .with_context(|| format!("writing {}", path.display()))?;
            file.sync_all()
                .with_context(|| format!("syncing {}", path.display()))?;
        }
        Ok(())
    }

    /// Hard-link kernel, initrd, optional fdt and each addon into the
    /// revision's `.pv/` boot-link directory under the fixed names the
    /// boot firmware expects.
    pub fn link_boot_assets(&self, state: &State) -> Result<()> {
        let rev_dir = self.rev_dir(&state.rev);
        let pv_dir = rev_dir.join(".pv");
        create_dir_all(&pv_dir).with_context(|| format!("creating {}", pv_dir.display()))?;
        let prefix = state.spec.bsp_prefix();

        let mut links = vec![
            (format!("{}{}", prefix, state.bsp.kernel), "pv-kernel.img".to_string()),
            (format!("{}{}", prefix, state.bsp.initrd), "pv-initrd.img".to_string()),
        ];
        for (i, addon) in state.addons.iter().enumerate() {
            links.push((format!("{}{}", prefix, addon), format!("pv-initrd.img.{}", i)));
        }
        if let Some(fdt) = &state.bsp.fdt {
            links.push((format!("{}{}", prefix, fdt), "pv-fdt.dtb".to_string()));
        }

        for (src_rel, dst_name) in links {
            let src = rev_dir.join(&src_rel);
            let dst = pv_dir.join(&dst_name);
            if dst.exists() {
                remove_file(&dst).with_context(|| format!("removing {}", dst.display()))?;
            }
            std::fs::hard_link(&src, &dst).with_context(|| {
                format!("linking {} to {}", src.display(), dst.display())
            })?;
        }
        debug!("linked boot assets for rev {}", state.rev);
        Ok(())
    }

    /// Point `trails/current` and `logs/current` at a revision. The swap
    /// is unlink + symlink; readers following the link see old or new,
    /// never a mix.
    pub fn set_active(&self, rev: &str) -> Result<()> {
        for base in [self.trails_dir(), self.mnt.join("logs")] {
            create_dir_all(&base).with_context(|| format!("creating {}", base.display()))?;
            let current = base.join("current");
            if read_link(&current).is_ok() {
                remove_file(&current)
                    .with_context(|| format!("removing {}", current.display()))?;
            }
            symlink(rev, &current)
                .with_context(|| format!("linking {} to {}", current.display(), rev))?;
        }
        Ok(())
    }

    /// Revision named by the `trails/current` symlink, if any.
    pub fn current_rev(&self) -> Option<String> {
        read_link(self.trails_dir().join("current"))
            .ok()
            .and_then(|p| p.to_str().map(str::to_string))
    }

    /// Recursively delete a revision's trail, logs and volume state.
    /// Returns the trail bytes freed.
    pub fn remove_rev(&self, rev: &str) -> Result<u64> {
        debug!("removing revision {} from disk", rev);
        let trail = self.rev_dir(rev);
        let reclaimed = dir_size(&trail);
        for dir in [trail, self.logs_dir(rev), self.disks_dir(rev)] {
            if dir.exists() {
                remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
            }
        }
        nix::unistd::sync();
        Ok(reclaimed)
    }

    /// Replace the factory revision's state with that of another
    /// revision.
    pub fn update_factory(&self, src_rev: &str) -> Result<()> {
        let json = self.read_state_json(src_rev)?;
        self.remove_rev(FACTORY_REV)?;
        self.write_state(FACTORY_REV, &json)
    }

    /// All revisions on disk: `trails/*` plus `trails/locals/*`,
    /// excluding the bookkeeping entries.
    pub fn list_revs(&self) -> Result<Vec<String>> {
        let mut revs = Vec::new();
        self.scan_revs(&self.trails_dir(), "", &mut revs)?;
        let locals = self.trails_dir().join("locals");
        if locals.is_dir() {
            self.scan_revs(&locals, "locals/", &mut revs)?;
        }
        revs.sort();
        Ok(revs)
    }

    fn scan_revs(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in
            read_dir(dir).with_context(|| format!("scanning {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if name == "current" || name == "locals" {
                continue;
            }
            if !entry.file_type()?.is_dir() {
                continue;
            }
            out.push(format!("{}{}", prefix, name));
        }
        Ok(())
    }

    /// Write the progress sidecar: truncate-and-write followed by fsync.
    pub fn set_progress(&self, rev: &str, progress: &str) -> Result<()> {
        let path = self.rev_dir(rev).join(".pv/progress");
        if let Some(dir) = path.parent() {
            create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(progress.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", path.display()))?;
        Ok(())
    }

    pub fn read_progress(&self, rev: &str) -> Option<String> {
        read_to_string(self.rev_dir(rev).join(".pv/progress")).ok()
    }

    pub fn write_commitmsg(&self, rev: &str, msg: &str) -> Result<()> {
        let path = self.rev_dir(rev).join(".pv/commitmsg");
        if let Some(dir) = path.parent() {
            create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        std::fs::write(&path, msg).with_context(|| format!("writing {}", path.display()))
    }

    pub fn read_commitmsg(&self, rev: &str) -> Option<String> {
        read_to_string(self.rev_dir(rev).join(".pv/commitmsg")).ok()
    }

    /// Revision listing served over the control channel.
    pub fn revisions_json(&self) -> Result<String> {
        let mut entries = Vec::new();
        for rev in self.list_revs()? {
            let progress: Value = self
                .read_progress(&rev)
                .and_then(|p| serde_json::from_str(&p).ok())
                .unwrap_or_else(|| json!({}));
            let commitmsg = self.read_commitmsg(&rev).unwrap_or_default();
            entries.push(json!({
                "name": rev,
                "commitmsg": commitmsg,
                "progress": progress,
            }));
        }
        serde_json::to_string(&entries).context("serialising revision list")
    }

    /// Whether threshold-triggered collection should run now.
    pub fn gc_threshold_reached(&self, gc: &GcConfig) -> bool {
        if gc.threshold == 0 {
            return false;
        }
        match DiskSpace::read(&self.mnt, gc) {
            Ok(space) => {
                if space.real_free_percent < gc.threshold {
                    info!(
                        "free disk space is {}%, under the {}% threshold",
                        space.real_free_percent, gc.threshold
                    );
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                warn!("could not read disk space: {:#}", e);
                false
            }
        }
    }

    /// Reclaim unused revisions, then unreferenced objects. Returns the
    /// byte count freed.
    pub fn gc_run(&self, objects: &ObjectStore, pins: &GcPins) -> Result<u64> {
        let mut reclaimed: u64 = 0;

        for rev in self.list_revs()? {
            if pins.is_pinned(&rev) {
                continue;
            }
            reclaimed += self.remove_rev(&rev)?;
        }

        // orphaned objects: a link count of one means no surviving
        // revision references the blob
        let pending_objects: Vec<&str> = pins
            .pending
            .map(|s| s.objects.values().map(String::as_str).collect())
            .unwrap_or_default();
        for id in objects.list_ids().context("listing objects")? {
            let path = objects.path_for(&id);
            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.nlink() > 1 {
                continue;
            }
            if pending_objects.contains(&id.as_str()) {
                continue;
            }
            remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            nix::unistd::sync();
            reclaimed += meta.size();
            debug!("removed unused object {}", id);
        }

        if reclaimed > 0 {
            let human = Byte::from_u64(reclaimed).get_appropriate_unit(UnitType::Binary);
            info!("garbage collector reclaimed {}", format!("{human:.1}"));
        }
        Ok(reclaimed)
    }

    /// Seed the `/pv` hint files consumers on the device read.
    pub fn seed_hints(&self, pv_dir: &Path, config: &Config) -> Result<()> {
        create_dir_all(pv_dir).with_context(|| format!("creating {}", pv_dir.display()))?;
        std::fs::write(pv_dir.join("challenge"), "").context("writing challenge hint")?;
        let device_id = if config.is_claimed() {
            format!("{}\n", config.creds.id)
        } else {
            String::new()
        };
        std::fs::write(pv_dir.join("device-id"), device_id).context("writing device-id hint")?;
        std::fs::write(
            pv_dir.join("pantahub-host"),
            format!("https://{}:{}\n", config.creds.host, config.creds.port),
        )
        .context("writing pantahub-host hint")?;
        Ok(())
    }
}

/// Revisions that must survive a collection pass.
#[derive(Debug, Default)]
pub struct GcPins<'a> {
    pub running: Option<&'a str>,
    pub pending: Option<&'a State>,
    pub boot_rev: Option<String>,
    pub keep_factory: bool,
}

impl GcPins<'_> {
    fn is_pinned(&self, rev: &str) -> bool {
        if Some(rev) == self.running {
            return true;
        }
        if let Some(pending) = self.pending {
            if pending.rev == rev {
                return true;
            }
        }
        if self.boot_rev.as_deref() == Some(rev) {
            return true;
        }
        self.keep_factory && rev == FACTORY_REV
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
    pub free_percent: u32,
    pub reserved: u64,
    pub reserved_percent: u32,
    pub real_free: u64,
    pub real_free_percent: u32,
}

impl DiskSpace {
    /// Figures are recomputed from `statfs` on every call; nothing is
    /// cached.
    pub fn read(path: &Path, gc: &GcConfig) -> Result<Self> {
        let stat = nix::sys::statfs::statfs(path)
            .map_err(|e| anyhow!("statfs {}: {}", path.display(), e))?;
        let bsize = stat.block_size() as u64;
        let total = bsize * stat.blocks();
        let free = bsize * stat.blocks_free();
        let reserved_percent = gc.reserved.min(100);
        let reserved = total * reserved_percent as u64 / 100;
        let real_free = free.saturating_sub(reserved);
        let percent = |part: u64| -> u32 {
            if total == 0 {
                0
            } else {
                (part * 100 / total).min(100) as u32
            }
        };
        Ok(Self {
            total,
            free,
            free_percent: percent(free),
            reserved,
            reserved_percent,
            real_free,
            real_free_percent: percent(real_free),
        })
    }
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::sha256_hex;
    use std::fs::write;
    use tempfile::TempDir;

    fn store() -> (TempDir, RevisionStore) {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::new(dir.path());
        store.ensure_layout().unwrap();
        (dir, store)
    }

    #[test]
    fn test_is_revision_local() {
        assert!(is_revision_local("locals/dev1"));
        assert!(!is_revision_local("10"));
        assert!(!is_revision_local("locals"));
        assert!(!is_revision_local("locals/a/b"));
        assert!(!is_revision_local("other/dev1"));
    }

    #[test]
    fn test_write_and_read_state() {
        let (_dir, store) = store();
        store.write_state("10", "{\"a\": 1}").unwrap();
        assert_eq!(store.read_state_json("10").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_set_active_swaps_symlink() {
        let (_dir, store) = store();
        store.write_state("10", "{}").unwrap();
        store.write_state("11", "{}").unwrap();

        store.set_active("10").unwrap();
        assert_eq!(store.current_rev().as_deref(), Some("10"));
        store.set_active("11").unwrap();
        assert_eq!(store.current_rev().as_deref(), Some("11"));
        // the link resolves
        assert!(store.trails_dir().join("current/.pvr/json").exists());
    }

    #[test]
    fn test_list_revs_excludes_bookkeeping() {
        let (_dir, store) = store();
        store.write_state("0", "{}").unwrap();
        store.write_state("10", "{}").unwrap();
        store.write_state("locals/dev1", "{}").unwrap();
        store.set_active("10").unwrap();

        let revs = store.list_revs().unwrap();
        assert_eq!(revs, vec!["0", "10", "locals/dev1"]);
    }

    #[test]
    fn test_update_factory() {
        let (_dir, store) = store();
        store.write_state("0", "{\"old\": true}").unwrap();
        store.write_state("12", "{\"new\": true}").unwrap();
        store.update_factory("12").unwrap();
        assert_eq!(store.read_state_json("0").unwrap(), "{\"new\": true}");
    }

    #[test]
    fn test_progress_and_commitmsg_sidecars() {
        let (_dir, store) = store();
        store.write_state("7", "{}").unwrap();
        store.set_progress("7", "{\"status\":\"QUEUED\"}").unwrap();
        assert_eq!(
            store.read_progress("7").unwrap(),
            "{\"status\":\"QUEUED\"}"
        );
        store.write_commitmsg("7", "first cut").unwrap();

        let listing: Value =
            serde_json::from_str(&store.revisions_json().unwrap()).unwrap();
        let entry = listing
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["name"] == "7")
            .unwrap();
        assert_eq!(entry["commitmsg"], "first cut");
        assert_eq!(entry["progress"]["status"], "QUEUED");
    }

    fn multi1_state(rev: &str, kernel: &[u8], initrd: &[u8]) -> State {
        let json = format!(
            r##"{{
  "#spec": "pantavisor-multi-platform@1",
  "pantavisor.json": {{"linux": "kernel.img", "initrd": "initrd.img",
                       "platforms": [], "volumes": [], "addons": []}},
  "kernel.img": "{}",
  "initrd.img": "{}"
}}"##,
            sha256_hex(kernel),
            sha256_hex(initrd)
        );
        State::parse(&json, rev).unwrap()
    }

    #[test]
    fn test_link_boot_assets_and_checksums() {
        let (dir, store) = store();
        let objects = ObjectStore::new(dir.path(), true);
        let state = multi1_state("10", b"kernel bits", b"initrd bits");

        store.write_state("10", &state.json).unwrap();
        objects
            .put(&sha256_hex(b"kernel bits"), &mut &b"kernel bits"[..])
            .unwrap();
        objects
            .put(&sha256_hex(b"initrd bits"), &mut &b"initrd bits"[..])
            .unwrap();
        for (path, id) in &state.objects {
            objects.link_into(&store.rev_dir("10").join(path), id).unwrap();
        }
        state.validate_checksums(&store.rev_dir("10")).unwrap();

        store.link_boot_assets(&state).unwrap();
        let pv = store.rev_dir("10").join(".pv");
        assert_eq!(std::fs::read(pv.join("pv-kernel.img")).unwrap(), b"kernel bits");
        assert_eq!(std::fs::read(pv.join("pv-initrd.img")).unwrap(), b"initrd bits");
        assert!(!pv.join("pv-fdt.dtb").exists());

        // relinking over existing links is fine
        store.link_boot_assets(&state).unwrap();
    }

    #[test]
    fn test_expand_inline_jsons() {
        let (_dir, store) = store();
        let state = multi1_state("10", b"k", b"i");
        store.write_state("10", &state.json).unwrap();
        store.expand_inline_jsons(&state).unwrap();

        let manifest = store.rev_dir("10").join("pantavisor.json");
        let value: Value =
            serde_json::from_str(&read_to_string(manifest).unwrap()).unwrap();
        assert_eq!(value["linux"], "kernel.img");
    }

    #[test]
    fn test_gc_pins_and_idempotence() {
        let (dir, store) = store();
        let objects = ObjectStore::new(dir.path(), true);

        for rev in ["0", "8", "9", "10", "11", "locals/dev1"] {
            store.write_state(rev, "{}").unwrap();
        }
        store.set_active("10").unwrap();

        // one object linked into rev 10, one orphan
        let kept = sha256_hex(b"kept");
        let orphan = sha256_hex(b"orphan");
        objects.put(&kept, &mut &b"kept"[..]).unwrap();
        objects.put(&orphan, &mut &b"orphan"[..]).unwrap();
        objects
            .link_into(&store.rev_dir("10").join("kept.img"), &kept)
            .unwrap();

        let pins = GcPins {
            running: Some("10"),
            pending: None,
            boot_rev: Some("9".to_string()),
            keep_factory: true,
        };
        let reclaimed = store.gc_run(&objects, &pins).unwrap();
        assert!(reclaimed > 0);

        let revs = store.list_revs().unwrap();
        assert_eq!(revs, vec!["0", "10", "9"]);
        assert!(objects.contains_valid(&kept));
        assert!(!objects.path_for(&orphan).exists());

        // second run with no intervening mutation frees nothing
        assert_eq!(store.gc_run(&objects, &pins).unwrap(), 0);
    }

    #[test]
    fn test_gc_collects_factory_without_keep() {
        let (dir, store) = store();
        let objects = ObjectStore::new(dir.path(), true);
        store.write_state("0", "{}").unwrap();
        store.write_state("10", "{}").unwrap();

        let pins = GcPins {
            running: Some("10"),
            pending: None,
            boot_rev: None,
            keep_factory: false,
        };
        store.gc_run(&objects, &pins).unwrap();
        assert_eq!(store.list_revs().unwrap(), vec!["10"]);
    }

    #[test]
    fn test_disk_space_percentages_clamped() {
        let dir = TempDir::new().unwrap();
        let gc = GcConfig {
            reserved: 5,
            ..Default::default()
        };
        let space = DiskSpace::read(dir.path(), &gc).unwrap();
        assert!(space.free_percent <= 100);
        assert!(space.real_free_percent <= 100);
        assert!(space.real_free <= space.free);

        // reserving everything clamps real-free to zero
        let gc = GcConfig {
            reserved: 100,
            ..Default::default()
        };
        let space = DiskSpace::read(dir.path(), &gc).unwrap();
        assert_eq!(space.real_free, 0);
        assert_eq!(space.real_free_percent, 0);
    }

    #[test]
    fn test_seed_hints() {
        let (_dir, store) = store();
        let pv = TempDir::new().unwrap();
        let mut config = Config::default();
        config.creds.id = "abc123".to_string();
        config.creds.prn = "prn:::devices:/abc123".to_string();
        config.creds.host = "hub.example.com".to_string();

        store.seed_hints(pv.path(), &config).unwrap();
        assert_eq!(
            read_to_string(pv.path().join("device-id")).unwrap(),
            "abc123\n"
        );
        assert_eq!(
            read_to_string(pv.path().join("pantahub-host")).unwrap(),
            "https://hub.example.com:443\n"
        );
        assert!(pv.path().join("challenge").exists());
    }

    #[test]
    fn test_remove_rev_reports_reclaimed_bytes() {
        let (_dir, store) = store();
        store.write_state("5", "{}").unwrap();
        write(store.rev_dir("5").join("payload"), vec![0u8; 4096]).unwrap();
        let reclaimed = store.remove_rev("5").unwrap();
        assert!(reclaimed >= 4096);
        assert!(!store.rev_dir("5").exists());
        // removing a nonexistent revision is not an error
        assert_eq!(store.remove_rev("5").unwrap(), 0);
    }
}
