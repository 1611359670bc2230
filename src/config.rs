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

//! Process-wide typed configuration, loaded from flat `key=value` files
//! with boot-cmdline overrides and persistent credential write-back.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::{create_dir_all, read_to_string, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

/// Default location of the factory config shipped in the initrd.
pub const FACTORY_CONFIG_PATH: &str = "/etc/pantavisor.config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderType {
    UbootPlain,
    UbootPvk,
    Grub,
}

impl FromStr for BootloaderType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uboot" => Ok(Self::UbootPlain),
            "uboot-pvk" => Ok(Self::UbootPvk),
            "grub" => Ok(Self::Grub),
            _ => bail!("unknown bootloader type '{}'", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurebootMode {
    Disabled,
    Lenient,
    Strict,
}

impl FromStr for SecurebootMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            _ => bail!("unknown secureboot mode '{}'", s),
        }
    }
}

impl fmt::Display for SecurebootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Lenient => "lenient",
            Self::Strict => "strict",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub metacachedir: Option<String>,
    pub dropbearcachedir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CredsConfig {
    pub typ: String,
    pub host: String,
    pub port: u16,
    pub host_proxy: Option<String>,
    pub port_proxy: u16,
    pub noproxyconnect: bool,
    pub id: String,
    pub prn: String,
    pub secret: String,
    pub token: Option<String>,
    pub tpm_key: Option<String>,
    pub tpm_cert: Option<String>,
}

impl Default for CredsConfig {
    fn default() -> Self {
        Self {
            typ: "builtin".to_string(),
            host: "api.pantahub.com".to_string(),
            port: 443,
            host_proxy: None,
            port_proxy: 0,
            noproxyconnect: false,
            id: String::new(),
            prn: String::new(),
            secret: String::new(),
            token: None,
            tpm_key: None,
            tpm_cert: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Percent of total space always kept in reserve.
    pub reserved: u32,
    pub keep_factory: bool,
    /// Real-free percent under which the collector runs opportunistically.
    /// Zero disables threshold-triggered runs.
    pub threshold: u32,
    pub threshold_defertime: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            reserved: 5,
            keep_factory: false,
            threshold: 0,
            threshold_defertime: 600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub device: String,
    pub fstype: String,
    pub opts: Option<String>,
    pub mntpoint: PathBuf,
    pub mnttype: Option<String>,
    pub logtempsize: Option<String>,
    /// Seconds to wait for the storage device node to appear.
    pub wait: u32,
    pub gc: GcConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            fstype: "ext4".to_string(),
            opts: None,
            mntpoint: PathBuf::from("/storage"),
            mnttype: None,
            logtempsize: None,
            wait: 5,
            gc: GcConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Wait-phase poll period in seconds.
    pub interval: u32,
    /// Rollback deadline while a trial boot has no connectivity.
    pub network_timeout: u32,
    pub use_tmp_objects: bool,
    pub revision_retries: u32,
    pub revision_retry_timeout: u32,
    /// Probation duration before a tested update is committed.
    pub commit_delay: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval: 60,
            network_timeout: 120,
            use_tmp_objects: true,
            revision_retries: 10,
            revision_retry_timeout: 120,
            commit_delay: 180,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlConfig {
    pub typ: BootloaderType,
    pub mtd_only: bool,
    pub mtd_env: Option<String>,
}

impl Default for BlConfig {
    fn default() -> Self {
        Self {
            typ: BootloaderType::UbootPlain,
            mtd_only: false,
            mtd_env: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WdtConfig {
    pub enabled: bool,
    pub timeout: u32,
}

impl Default for WdtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 15,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetConfig {
    pub brdev: Option<String>,
    pub braddress4: Option<String>,
    pub brmask4: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: Option<PathBuf>,
    pub maxsize: u64,
    pub level: u32,
    pub buf_nitems: u32,
    pub push: bool,
    pub capture: bool,
    pub loggers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            maxsize: 2 * 1024 * 1024,
            level: 3,
            buf_nitems: 128,
            push: true,
            capture: true,
            loggers: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    pub bl: BlConfig,
    pub creds: CredsConfig,
    pub factory_autotok: Option<String>,
    pub storage: StorageConfig,
    pub updater: UpdaterConfig,
    pub wdt: WdtConfig,
    pub net: NetConfig,
    pub log: LogConfig,
    pub lxc_log_level: u32,
    pub libthttp_loglevel: u32,
    pub control_remote: bool,
    pub secureboot_mode: SecurebootMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            bl: BlConfig::default(),
            creds: CredsConfig::default(),
            factory_autotok: None,
            storage: StorageConfig::default(),
            updater: UpdaterConfig::default(),
            wdt: WdtConfig::default(),
            net: NetConfig::default(),
            log: LogConfig::default(),
            lxc_log_level: 2,
            libthttp_loglevel: 1,
            control_remote: true,
            secureboot_mode: SecurebootMode::Lenient,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("parsing numeric config key '{}' from '{}'", key, value))
}

impl Config {
    /// Load the factory config file, then apply cmdline overrides.
    /// Credentials are loaded separately once storage is mounted.
    pub fn load(factory_path: &Path, overrides: &[(String, String)]) -> Result<Self> {
        let mut config = Config::default();
        let content = read_to_string(factory_path)
            .with_context(|| format!("reading config file {}", factory_path.display()))?;
        config
            .apply_str(&content)
            .with_context(|| format!("parsing config file {}", factory_path.display()))?;
        for (key, value) in overrides {
            config.override_value(key, value);
        }
        Ok(config)
    }

    /// Parse a flat newline-delimited `key=value` buffer. Blank lines and
    /// `#` comments are skipped.
    pub fn apply_str(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => bail!("malformed config line '{}'", line),
            };
            self.apply(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Set a single key. Unknown keys are tolerated so configs written by
    /// newer releases still load.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "cache.metacachedir" => self.cache.metacachedir = Some(value.to_string()),
            "cache.dropbearcachedir" => self.cache.dropbearcachedir = Some(value.to_string()),

            "bootloader.type" => self.bl.typ = value.parse()?,
            "bootloader.mtd_only" => self.bl.mtd_only = parse_bool(value),
            "bootloader.mtd_env" => self.bl.mtd_env = Some(value.to_string()),

            "creds.type" => self.creds.typ = value.to_string(),
            "creds.host" => self.creds.host = value.to_string(),
            "creds.port" => self.creds.port = parse_num(key, value)?,
            "creds.host_proxy" => self.creds.host_proxy = Some(value.to_string()),
            "creds.port_proxy" => self.creds.port_proxy = parse_num(key, value)?,
            "creds.noproxyconnect" => self.creds.noproxyconnect = parse_bool(value),
            "creds.id" => self.creds.id = value.to_string(),
            "creds.prn" => self.creds.prn = value.to_string(),
            "creds.secret" => self.creds.secret = value.to_string(),
            "creds.token" => self.creds.token = Some(value.to_string()),
            "creds.tpm.key" => self.creds.tpm_key = Some(value.to_string()),
            "creds.tpm.cert" => self.creds.tpm_cert = Some(value.to_string()),

            "factory.autotok" => self.factory_autotok = Some(value.to_string()),

            "storage.device" => self.storage.device = value.to_string(),
            "storage.fstype" => self.storage.fstype = value.to_string(),
            "storage.opts" => self.storage.opts = Some(value.to_string()),
            "storage.mntpoint" => self.storage.mntpoint = PathBuf::from(value),
            "storage.mnttype" => self.storage.mnttype = Some(value.to_string()),
            "storage.logtempsize" => self.storage.logtempsize = Some(value.to_string()),
            "storage.wait" => self.storage.wait = parse_num(key, value)?,
            "storage.gc.reserved" => self.storage.gc.reserved = parse_num(key, value)?,
            "storage.gc.keep_factory" => self.storage.gc.keep_factory = parse_bool(value),
            "storage.gc.threshold" => self.storage.gc.threshold = parse_num(key, value)?,
            "storage.gc.threshold.defertime" => {
                self.storage.gc.threshold_defertime = parse_num(key, value)?
            }
            // deprecated alias, kept for configs written by old releases
            "updater.keep_factory" => self.storage.gc.keep_factory = parse_bool(value),

            "updater.interval" => self.updater.interval = parse_num(key, value)?,
            "updater.network_timeout" => self.updater.network_timeout = parse_num(key, value)?,
            "updater.use_tmp_objects" => self.updater.use_tmp_objects = parse_bool(value),
            "updater.commit.delay" => self.updater.commit_delay = parse_num(key, value)?,
            "revision.retries" => self.updater.revision_retries = parse_num(key, value)?,
            "revision.retries.timeout" => {
                self.updater.revision_retry_timeout = parse_num(key, value)?
            }

            "wdt.enabled" => self.wdt.enabled = parse_bool(value),
            "wdt.timeout" => self.wdt.timeout = parse_num(key, value)?,

            "net.brdev" => self.net.brdev = Some(value.to_string()),
            "net.braddress4" => self.net.braddress4 = Some(value.to_string()),
            "net.brmask4" => self.net.brmask4 = Some(value.to_string()),

            "log.dir" => self.log.dir = Some(PathBuf::from(value)),
            "log.maxsize" => self.log.maxsize = parse_num(key, value)?,
            "log.level" => self.log.level = parse_num(key, value)?,
            "log.buf_nitems" => self.log.buf_nitems = parse_num(key, value)?,
            "log.push" => self.log.push = parse_bool(value),
            // deprecated alias
            "pantahub.log.push" => self.log.push = parse_bool(value),
            "log.capture" => self.log.capture = parse_bool(value),
            "log.loggers" => self.log.loggers = parse_bool(value),

            "lxc.log.level" => self.lxc_log_level = parse_num(key, value)?,
            "libthttp.loglevel" => self.libthttp_loglevel = parse_num(key, value)?,

            "control.remote" => self.control_remote = parse_bool(value),
            "secureboot.mode" => self.secureboot_mode = value.parse()?,

            _ => tracing::debug!("ignoring unknown config key '{}'", key),
        }
        Ok(())
    }

    /// Late override of a single key, e.g. from the boot cmdline or user
    /// metadata. Parse failures are logged and dropped rather than
    /// propagated, since override sources are not trusted to be well formed.
    pub fn override_value(&mut self, key: &str, value: &str) {
        if let Err(e) = self.apply(key, value) {
            tracing::warn!("discarding config override '{}': {:#}", key, e);
        }
    }

    /// Load an override file patching a subset of keys.
    pub fn load_override_file(&mut self, path: &Path) -> Result<()> {
        let content = read_to_string(path)
            .with_context(|| format!("reading override file {}", path.display()))?;
        self.apply_str(&content)
            .with_context(|| format!("parsing override file {}", path.display()))
    }

    pub fn creds_path(&self) -> PathBuf {
        self.storage.mntpoint.join("config/pantahub.config")
    }

    pub fn unclaimed_creds_path(&self) -> PathBuf {
        self.storage.mntpoint.join("config/unclaimed.config")
    }

    /// Load per-device credentials from persistent storage. The claimed
    /// config wins; while unclaimed only `unclaimed.config` exists.
    pub fn load_creds(&mut self) -> Result<()> {
        for path in [self.unclaimed_creds_path(), self.creds_path()] {
            if let Ok(content) = read_to_string(&path) {
                self.apply_str(&content)
                    .with_context(|| format!("parsing credentials {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Persist credentials: write a temp file next to the target, fsync,
    /// rename. Only canonical key names are written.
    pub fn save_creds(&self) -> Result<()> {
        let path = self.creds_path();
        let dir = path
            .parent()
            .context("credentials path has no parent directory")?;
        create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        writeln!(tmp, "creds.type={}", self.creds.typ).context("writing credentials")?;
        writeln!(tmp, "creds.host={}", self.creds.host).context("writing credentials")?;
        writeln!(tmp, "creds.port={}", self.creds.port).context("writing credentials")?;
        writeln!(tmp, "creds.id={}", self.creds.id).context("writing credentials")?;
        writeln!(tmp, "creds.prn={}", self.creds.prn).context("writing credentials")?;
        writeln!(tmp, "creds.secret={}", self.creds.secret).context("writing credentials")?;
        tmp.as_file().sync_all().context("syncing credentials")?;
        tmp.persist(&path)
            .with_context(|| format!("renaming credentials into {}", path.display()))?;
        // make the rename durable
        File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("syncing {}", dir.display()))?;
        Ok(())
    }

    /// Whether this device has hub credentials at all.
    pub fn is_claimed(&self) -> bool {
        !self.creds.prn.is_empty()
    }
}

/// Split boot-cmdline tokens into config overrides. Tokens prefixed `pv_`
/// or `ph_` and containing `=` patch the matching config key.
pub fn cmdline_overrides(tokens: &[String]) -> Vec<(String, String)> {
    let mut overrides = Vec::new();
    for token in tokens {
        let stripped = match token.strip_prefix("pv_").or_else(|| token.strip_prefix("ph_")) {
            Some(s) => s,
            None => continue,
        };
        if let Some((key, value)) = stripped.split_once('=') {
            overrides.push((key.to_string(), value.to_string()));
        }
    }
    overrides
}
