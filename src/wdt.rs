// Copyright 2021 CoreOS, Inc.
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

//! Hardware watchdog kicker. The timeout must exceed the worst-case
//! controller tick; the controller kicks once per tick.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{debug, warn};

const WATCHDOG_DEV: &str = "/dev/watchdog";

// WDIOC_SETTIMEOUT from linux/watchdog.h
nix::ioctl_readwrite!(wdioc_settimeout, b'W', 6, libc::c_int);

#[derive(Debug)]
pub struct Watchdog {
    file: std::fs::File,
}

impl Watchdog {
    pub fn open(timeout: u32) -> Result<Self> {
        Self::open_path(Path::new(WATCHDOG_DEV), timeout)
    }

    pub fn open_path(path: &Path, timeout: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut secs = timeout as libc::c_int;
        // tolerate drivers without timeout support
        if let Err(e) = unsafe { wdioc_settimeout(file.as_raw_fd(), &mut secs) } {
            warn!("could not set watchdog timeout: {}", e);
        } else {
            debug!("watchdog timeout set to {}s", secs);
        }
        Ok(Self { file })
    }

    pub fn kick(&mut self) {
        if let Err(e) = self.file.write_all(b"k") {
            warn!("watchdog kick failed: {}", e);
        }
    }
}
