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

//! Cooperation with the boot firmware through a small set of named
//! environment variables. Arming a trial boot is the linearisation point
//! of an update: the env write must reach stable storage before the
//! controller requests a reboot.

mod grub;
mod uboot;

use anyhow::Result;
use std::path::PathBuf;

use crate::config::{BootloaderType, Config};
use crate::storage::FACTORY_REV;

pub use self::grub::GrubEnv;
pub use self::uboot::{PvkEnv, UbootEnv};

/// Revision to boot next, one-shot: the firmware either promotes it into
/// `pv_rev` or clears it and raises the rollback flag.
pub const VAR_TRY: &str = "pv_try";
/// Last known-good revision.
pub const VAR_REV: &str = "pv_rev";
/// Raised by the firmware after it has rolled a failed trial boot back.
pub const VAR_BOOT_ROLLBACK: &str = "pv_boot_rollback";

/// One bootloader environment back-end. Mutations are buffered in memory
/// until `flush`, which must be atomic and durable.
pub trait EnvBackend: std::fmt::Debug {
    fn get(&self, key: &str) -> Option<&str>;
    fn set(&mut self, key: &str, value: &str);
    fn unset(&mut self, key: &str);
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug)]
pub struct BootEnv {
    backend: Box<dyn EnvBackend + Send>,
}

impl BootEnv {
    /// Open the configured back-end. The environment location defaults to
    /// a file under `<mnt>/boot/` and can be redirected with
    /// `bootloader.mtd_env`.
    pub fn open(config: &Config) -> Result<Self> {
        let default_name = match config.bl.typ {
            BootloaderType::UbootPlain => "uboot.txt",
            BootloaderType::UbootPvk => "uboot.txt.pvk",
            BootloaderType::Grub => "grubenv",
        };
        let path = match &config.bl.mtd_env {
            Some(p) => PathBuf::from(p),
            None => config.storage.mntpoint.join("boot").join(default_name),
        };
        let backend: Box<dyn EnvBackend + Send> = match config.bl.typ {
            BootloaderType::UbootPlain => Box::new(UbootEnv::load(&path)?),
            BootloaderType::UbootPvk => Box::new(PvkEnv::load(&path)?),
            BootloaderType::Grub => Box::new(GrubEnv::load(&path)?),
        };
        Ok(Self { backend })
    }

    pub fn with_backend(backend: Box<dyn EnvBackend + Send>) -> Self {
        Self { backend }
    }

    /// Last known-good revision; a fresh environment boots the factory
    /// revision.
    pub fn get_rev(&self) -> String {
        match self.backend.get(VAR_REV) {
            Some(rev) if !rev.is_empty() => rev.to_string(),
            _ => FACTORY_REV.to_string(),
        }
    }

    pub fn get_try(&self) -> Option<String> {
        match self.backend.get(VAR_TRY) {
            Some(rev) if !rev.is_empty() => Some(rev.to_string()),
            _ => None,
        }
    }

    pub fn set_try(&mut self, rev: &str) -> Result<()> {
        self.backend.set(VAR_TRY, rev);
        self.backend.flush()
    }

    pub fn clear_try(&mut self) -> Result<()> {
        self.backend.unset(VAR_TRY);
        self.backend.flush()
    }

    pub fn set_rev(&mut self, rev: &str) -> Result<()> {
        self.backend.set(VAR_REV, rev);
        self.backend.flush()
    }

    pub fn rollback_flagged(&self) -> bool {
        matches!(self.backend.get(VAR_BOOT_ROLLBACK), Some(v) if !v.is_empty() && v != "0")
    }

    pub fn clear_rollback(&mut self) -> Result<()> {
        self.backend.unset(VAR_BOOT_ROLLBACK);
        self.backend.flush()
    }

    /// Simulate a firmware-side variable write.
    #[cfg(test)]
    pub fn set_var_for_test(&mut self, key: &str, value: &str) {
        self.backend.set(key, value);
        self.backend.flush().expect("flushing test variable");
    }
}
