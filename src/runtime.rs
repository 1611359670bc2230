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

//! Interfaces to the container runtime and the volume manager. The core
//! only sequences them by runlevel; how workloads actually start is a
//! separate component.

use anyhow::Result;

use crate::state::{Runlevel, State};

/// Starts and stops the container workloads of a state at a given
/// runlevel boundary.
pub trait PlatformRuntime {
    /// Start every platform with `runlevel >= from`.
    fn start(&mut self, state: &State, from: Runlevel) -> Result<()>;
    /// Stop every platform with `runlevel >= from`.
    fn stop(&mut self, state: &State, from: Runlevel) -> Result<()>;
    /// Whether any started platform has exited underneath us.
    fn check_exited(&mut self, state: &State) -> bool;
    /// A child pid was reaped; deregister it if it was ours.
    fn reaped(&mut self, pid: i32);
}

/// Mounts and unmounts the loopback images and filesystems of a state.
pub trait VolumeManager {
    fn mount(&mut self, state: &State, from: Runlevel) -> Result<()>;
    fn unmount(&mut self, state: &State, from: Runlevel) -> Result<()>;
}

/// Stand-in used when no container backend is wired in: everything
/// succeeds and nothing ever exits.
#[derive(Debug, Default)]
pub struct InertRuntime;

impl PlatformRuntime for InertRuntime {
    fn start(&mut self, state: &State, from: Runlevel) -> Result<()> {
        for platform in state.platforms_at_or_above(from) {
            tracing::debug!("runtime: would start platform '{}'", platform.name);
        }
        Ok(())
    }

    fn stop(&mut self, state: &State, from: Runlevel) -> Result<()> {
        for platform in state.platforms_at_or_above(from) {
            tracing::debug!("runtime: would stop platform '{}'", platform.name);
        }
        Ok(())
    }

    fn check_exited(&mut self, _state: &State) -> bool {
        false
    }

    fn reaped(&mut self, _pid: i32) {}
}

impl VolumeManager for InertRuntime {
    fn mount(&mut self, _state: &State, _from: Runlevel) -> Result<()> {
        Ok(())
    }

    fn unmount(&mut self, _state: &State, _from: Runlevel) -> Result<()> {
        Ok(())
    }
}
