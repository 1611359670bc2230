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

//! Ordered initialiser list building the controller's components, plus
//! the one-time early mounts performed when running as init.

use anyhow::{bail, Context, Result};
use nix::mount::{mount, MsFlags};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::bootloader::BootEnv;
use crate::cmdline::Args;
use crate::config::{Config, FACTORY_CONFIG_PATH};
use crate::controller::Controller;
use crate::ctrl::CtrlSocket;
use crate::hub::Hub;
use crate::metadata::MetadataStore;
use crate::objects::ObjectStore;
use crate::runtime::InertRuntime;
use crate::storage::RevisionStore;
use crate::wdt::Watchdog;

/// Partially constructed component set threaded through the entries.
struct Bootstrap {
    args: Args,
    pv_dir: PathBuf,
    config: Option<Config>,
    storage: Option<RevisionStore>,
    objects: Option<ObjectStore>,
    bootenv: Option<BootEnv>,
    meta: Option<MetadataStore>,
    hub: Option<Hub>,
    ctrl: Option<CtrlSocket>,
    wdt: Option<Watchdog>,
}

impl Bootstrap {
    fn config(&self) -> &Config {
        self.config.as_ref().expect("config entry runs first")
    }

    fn config_mut(&mut self) -> &mut Config {
        self.config.as_mut().expect("config entry runs first")
    }
}

struct InitEntry {
    name: &'static str,
    /// The dispatcher continues past a failed tolerant entry.
    can_fail: bool,
    run: fn(&mut Bootstrap) -> Result<()>,
}

const ENTRIES: &[InitEntry] = &[
    InitEntry {
        name: "config",
        can_fail: false,
        run: init_config,
    },
    InitEntry {
        name: "storage-mount",
        can_fail: false,
        run: init_storage_mount,
    },
    InitEntry {
        name: "credentials",
        can_fail: true,
        run: init_credentials,
    },
    InitEntry {
        name: "storage-layout",
        can_fail: false,
        run: init_storage_layout,
    },
    InitEntry {
        name: "log",
        can_fail: true,
        run: init_log,
    },
    InitEntry {
        name: "hints",
        can_fail: true,
        run: init_hints,
    },
    InitEntry {
        name: "metadata",
        can_fail: false,
        run: init_metadata,
    },
    InitEntry {
        name: "bootloader",
        can_fail: false,
        run: init_bootloader,
    },
    InitEntry {
        name: "control",
        can_fail: true,
        run: init_ctrl,
    },
    InitEntry {
        name: "watchdog",
        can_fail: true,
        run: init_wdt,
    },
    InitEntry {
        name: "hub",
        can_fail: true,
        run: init_hub,
    },
];

fn init_config(ctx: &mut Bootstrap) -> Result<()> {
    let factory_path = ctx
        .args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(FACTORY_CONFIG_PATH));
    let overrides = ctx.args.overrides();
    ctx.config = Some(Config::load(&factory_path, &overrides)?);
    Ok(())
}

fn init_storage_mount(ctx: &mut Bootstrap) -> Result<()> {
    let storage = ctx.config().storage.clone();
    if storage.device.is_empty() {
        // mount is managed externally (development runs, containers)
        return Ok(());
    }

    // wait for the device node to show up
    let deadline = Instant::now() + Duration::from_secs(storage.wait as u64);
    while !Path::new(&storage.device).exists() {
        if Instant::now() >= deadline {
            bail!("storage device {} did not appear", storage.device);
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    std::fs::create_dir_all(&storage.mntpoint)
        .with_context(|| format!("creating {}", storage.mntpoint.display()))?;
    match mount(
        Some(storage.device.as_str()),
        &storage.mntpoint,
        Some(storage.fstype.as_str()),
        MsFlags::empty(),
        storage.opts.as_deref(),
    ) {
        Ok(()) => Ok(()),
        // already mounted by the initrd
        Err(nix::errno::Errno::EBUSY) => Ok(()),
        Err(e) => Err(e).with_context(|| {
            format!(
                "mounting {} on {}",
                storage.device,
                storage.mntpoint.display()
            )
        }),
    }
}

fn init_credentials(ctx: &mut Bootstrap) -> Result<()> {
    ctx.config_mut().load_creds()
}

fn init_storage_layout(ctx: &mut Bootstrap) -> Result<()> {
    let mnt = ctx.config().storage.mntpoint.clone();
    let storage = RevisionStore::new(&mnt);
    storage.ensure_layout()?;
    let objects = ObjectStore::new(&mnt, ctx.config().updater.use_tmp_objects);
    objects.ensure_dirs().context("creating object store")?;
    ctx.storage = Some(storage);
    ctx.objects = Some(objects);
    Ok(())
}

fn init_log(ctx: &mut Bootstrap) -> Result<()> {
    let level = match ctx.config().log.level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    // double initialisation happens in tests; not fatal
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

fn init_hints(ctx: &mut Bootstrap) -> Result<()> {
    let pv_dir = ctx.pv_dir.clone();
    let storage = ctx
        .storage
        .as_ref()
        .context("storage layout entry runs first")?;
    storage.seed_hints(&pv_dir, ctx.config.as_ref().expect("config loaded"))
}

fn init_metadata(ctx: &mut Bootstrap) -> Result<()> {
    let cache_dir = ctx
        .config()
        .cache
        .metacachedir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.config().storage.mntpoint.join("cache/meta"));
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("creating {}", cache_dir.display()))?;
    ctx.meta = Some(MetadataStore::new(&ctx.pv_dir, Some(&cache_dir)));
    Ok(())
}

fn init_bootloader(ctx: &mut Bootstrap) -> Result<()> {
    ctx.bootenv = Some(BootEnv::open(ctx.config())?);
    Ok(())
}

fn init_ctrl(ctx: &mut Bootstrap) -> Result<()> {
    let path = ctx.pv_dir.join("pv-ctrl");
    ctx.ctrl = Some(CtrlSocket::bind(&path)?);
    Ok(())
}

fn init_wdt(ctx: &mut Bootstrap) -> Result<()> {
    let wdt = &ctx.config().wdt;
    if !wdt.enabled {
        return Ok(());
    }
    ctx.wdt = Some(Watchdog::open(wdt.timeout)?);
    Ok(())
}

fn init_hub(ctx: &mut Bootstrap) -> Result<()> {
    if !ctx.config().control_remote {
        info!("remote control disabled, not building a hub client");
        return Ok(());
    }
    ctx.hub = Some(Hub::new(ctx.config())?);
    Ok(())
}

/// Run the dispatcher and assemble the controller. A fatal entry aborts;
/// tolerant failures are logged and skipped.
pub fn execute(args: &Args, standalone: bool) -> Result<Controller> {
    let mut ctx = Bootstrap {
        args: args.clone(),
        pv_dir: args
            .pv_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/pv")),
        config: None,
        storage: None,
        objects: None,
        bootenv: None,
        meta: None,
        hub: None,
        ctrl: None,
        wdt: None,
    };
    std::fs::create_dir_all(&ctx.pv_dir)
        .with_context(|| format!("creating {}", ctx.pv_dir.display()))?;

    for entry in ENTRIES {
        match (entry.run)(&mut ctx) {
            Ok(()) => {}
            Err(e) if entry.can_fail => {
                warn!("initialiser '{}' failed, continuing: {:#}", entry.name, e);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("initialiser '{}'", entry.name));
            }
        }
    }

    let pv_dir = ctx.pv_dir.clone();
    Ok(Controller::new(
        ctx.config.context("config not initialised")?,
        ctx.storage.context("storage not initialised")?,
        ctx.objects.context("object store not initialised")?,
        ctx.bootenv.context("bootloader not initialised")?,
        ctx.meta.context("metadata not initialised")?,
        ctx.hub,
        ctx.ctrl,
        Box::new(InertRuntime),
        Box::new(InertRuntime),
        ctx.wdt,
        pv_dir,
        standalone,
    ))
}

fn try_mount(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    std::fs::create_dir_all(target).with_context(|| format!("creating {}", target))?;
    match mount(source, target, fstype, flags, data) {
        Ok(()) => Ok(()),
        // tolerate mounts already made by an initrd
        Err(nix::errno::Errno::EBUSY) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("mounting {}", target)),
    }
}

/// One-time mounts performed before anything else when running as init.
pub fn early_mounts() -> Result<()> {
    try_mount(
        Some("none"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )?;
    try_mount(
        Some("none"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::empty(),
        Some("size=10240k,mode=0755"),
    )?;
    try_mount(Some("none"), "/sys", Some("sysfs"), MsFlags::empty(), None)?;
    try_mount(
        Some("none"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::empty(),
        None,
    )?;
    try_mount(
        Some("none"),
        "/sys/fs/cgroup",
        Some("cgroup2"),
        MsFlags::empty(),
        None,
    )?;
    try_mount(Some("none"), "/run", Some("tmpfs"), MsFlags::empty(), None)?;
    try_mount(Some("none"), "/root", Some("tmpfs"), MsFlags::empty(), None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    fn args_for(dir: &TempDir, config_body: &str) -> Args {
        let config_path = dir.path().join("pantavisor.config");
        write(&config_path, config_body).unwrap();
        Args {
            manifest: false,
            config_path: Some(config_path),
            pv_dir: Some(dir.path().join("pv")),
            tokens: vec![],
        }
    }

    #[test]
    fn test_execute_builds_controller() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "storage.mntpoint={}\nwdt.enabled=0\ncontrol.remote=0\n",
            dir.path().join("storage").display()
        );
        let args = args_for(&dir, &body);
        let controller = execute(&args, true).unwrap();
        // storage layout was created
        assert!(dir.path().join("storage/trails").is_dir());
        assert!(dir.path().join("storage/objects").is_dir());
        // hint files seeded
        assert!(dir.path().join("pv/challenge").exists());
        drop(controller);
    }

    #[test]
    fn test_execute_fails_without_config() {
        let dir = TempDir::new().unwrap();
        let args = Args {
            manifest: false,
            config_path: Some(dir.path().join("missing.config")),
            pv_dir: Some(dir.path().join("pv")),
            tokens: vec![],
        };
        execute(&args, true).unwrap_err();
    }

    #[test]
    fn test_tolerant_entry_failure_continues() {
        let dir = TempDir::new().unwrap();
        // watchdog enabled but /dev/watchdog is absent in the build
        // environment: the tolerant entry must not sink the dispatcher
        let body = format!(
            "storage.mntpoint={}\ncontrol.remote=0\nwdt.enabled=1\n",
            dir.path().join("storage").display()
        );
        let args = args_for(&dir, &body);
        execute(&args, true).unwrap();
    }
}
