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

//! The update engine: materialise a target revision onto storage, arm
//! the bootloader, and walk one update record through its lifetime.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::io::Read;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::bootloader::BootEnv;
use crate::config::Config;
use crate::hub::StepProgress;
use crate::objects::{ObjectError, ObjectStore};
use crate::state::{Runlevel, State};
use crate::storage::{is_revision_local, RevisionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Queued,
    Downloading,
    Installed,
    Trying,
    Testing,
    Done,
    Failed,
}

impl UpdateStatus {
    /// Status string used in hub progress PUTs and the sidecar.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Downloading => "DOWNLOADING",
            Self::Installed => "INPROGRESS",
            Self::Trying => "TRYING",
            Self::Testing => "TESTING",
            Self::Done => "DONE",
            Self::Failed => "ERROR",
        }
    }
}

/// Failure classification drives the retry policy: transient errors are
/// retried with backoff, integrity errors are retried but reported as
/// WONTGO once retries run out, fatal errors stop the update at once.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("transient: {0:#}")]
    Transient(#[source] anyhow::Error),
    #[error("integrity: {0:#}")]
    Integrity(#[source] anyhow::Error),
    #[error("fatal: {0:#}")]
    Fatal(#[source] anyhow::Error),
}

impl UpdateError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

/// One in-flight update, owned by the controller.
#[derive(Debug)]
pub struct Update {
    pub pending: State,
    pub runlevel: Runlevel,
    pub status: UpdateStatus,
    pub retries: u32,
    pub began_at: Instant,
    /// Hand-delivered revision; never reported to the hub.
    pub local: bool,
    /// The last failure was an integrity error, reported as WONTGO.
    pub integrity_failure: bool,
    pub commitmsg: Option<String>,
}

impl Update {
    pub fn new(pending: State, local: bool) -> Self {
        Self {
            pending,
            runlevel: Runlevel::Data,
            status: UpdateStatus::Queued,
            retries: 0,
            began_at: Instant::now(),
            local,
            integrity_failure: false,
            commitmsg: None,
        }
    }

    pub fn rev(&self) -> &str {
        &self.pending.rev
    }

    pub fn is_trying(&self) -> bool {
        self.status == UpdateStatus::Trying
    }

    pub fn is_testing(&self) -> bool {
        self.status == UpdateStatus::Testing
    }

    /// Commands like reboot or local install are rejected while this
    /// holds.
    pub fn in_progress(&self) -> bool {
        !matches!(self.status, UpdateStatus::Done | UpdateStatus::Failed)
    }

    pub fn progress(&self, msg: &str, percent: u32) -> StepProgress {
        StepProgress::new(self.status.as_str(), msg, percent)
    }
}

/// What `resume` found in the bootloader environment after a reboot.
#[derive(Debug)]
pub struct Resumed {
    /// Revision to load and run now.
    pub boot_rev: String,
    /// Reconstructed update record, present when a trial boot is in
    /// progress or has just been rolled back.
    pub update: Option<Update>,
}

/// Read the bootloader environment and reconstruct an in-progress trial
/// boot, if any. Exactly one of "`pv_try` armed" and "update in
/// TRYING/TESTING" holds from here on: the armed revision becomes the
/// update record and the variable stays set until commit or rollback.
pub fn resume(storage: &RevisionStore, bootenv: &mut BootEnv) -> Result<Resumed> {
    let rev = bootenv.get_rev();
    let tried = bootenv.get_try();

    if bootenv.rollback_flagged() {
        // the firmware already rolled back to the last known-good
        // revision; report the failed trial if we still know its name
        warn!("boot firmware flagged a rollback, running {}", rev);
        let update = match &tried {
            Some(tried_rev) => match storage.read_state_json(tried_rev) {
                Ok(json) => State::parse(&json, tried_rev).ok().map(|state| {
                    let mut update = Update::new(state, is_revision_local(tried_rev));
                    update.status = UpdateStatus::Failed;
                    update
                }),
                Err(_) => None,
            },
            None => None,
        };
        bootenv.clear_try().context("clearing pv_try")?;
        bootenv.clear_rollback().context("clearing rollback flag")?;
        return Ok(Resumed {
            boot_rev: rev,
            update,
        });
    }

    match tried {
        Some(tried_rev) => {
            info!("resuming trial boot of revision {}", tried_rev);
            let json = storage
                .read_state_json(&tried_rev)
                .with_context(|| format!("loading trial revision {}", tried_rev))?;
            let state = State::parse(&json, &tried_rev)
                .with_context(|| format!("parsing trial revision {}", tried_rev))?;
            let mut update = Update::new(state, is_revision_local(&tried_rev));
            update.status = UpdateStatus::Trying;
            Ok(Resumed {
                boot_rev: tried_rev,
                update: Some(update),
            })
        }
        None => Ok(Resumed {
            boot_rev: rev,
            update: None,
        }),
    }
}

/// Build an update record from a step advertised by the hub. Returns
/// `None` when the step is already the running revision.
pub fn update_from_step(
    step: &crate::hub::Step,
    config: &Config,
    current_rev: &str,
) -> Result<Option<Update>, UpdateError> {
    if step.rev == current_rev {
        return Ok(None);
    }
    let json = step.state.to_string();
    if !crate::signature::verify(&json, config.secureboot_mode) {
        return Err(UpdateError::Fatal(anyhow!(
            "state signature verification failed for revision {}",
            step.rev
        )));
    }
    let state = State::parse(&json, &step.rev).map_err(UpdateError::Fatal)?;
    let mut update = Update::new(state, false);
    update.commitmsg = step.commitmsg.clone();
    Ok(Some(update))
}

/// Fetch every missing object of the pending state. `fetch` opens a
/// stream for one object id; the chunked copy through the object store
/// keeps the outer loop in control between reads.
pub fn download(
    update: &mut Update,
    objects: &ObjectStore,
    storage: &RevisionStore,
    fetch: &mut dyn FnMut(&str) -> Result<Box<dyn Read>>,
) -> Result<(), UpdateError> {
    update.status = UpdateStatus::Downloading;
    let total = update.pending.objects.len().max(1);
    let mut fetched = 0usize;

    // iterate a snapshot; progress writes must not observe a half-walked
    // map
    let wanted: Vec<(String, String)> = update
        .pending
        .objects
        .iter()
        .map(|(path, id)| (path.clone(), id.clone()))
        .collect();
    for (path, id) in wanted {
        fetched += 1;
        if objects.contains_valid(&id) {
            debug!("object {} already present, skipping", id);
            continue;
        }
        let mut reader = fetch(&id).map_err(UpdateError::Transient)?;
        match objects.put(&id, &mut *reader) {
            Ok(size) => debug!("fetched {} ({} bytes) for {}", id, size, path),
            Err(ObjectError::ChecksumMismatch { id, computed }) => {
                return Err(UpdateError::Integrity(anyhow!(
                    "object {} hashed to {}",
                    id,
                    computed
                )));
            }
            Err(ObjectError::InvalidId(id)) => {
                return Err(UpdateError::Fatal(anyhow!("invalid object id '{}'", id)));
            }
            Err(ObjectError::Io(e)) => {
                return Err(UpdateError::Transient(
                    anyhow::Error::from(e).context(format!("storing object {}", id)),
                ));
            }
        }
        let percent = (fetched * 100 / total) as u32;
        let progress = update.progress("downloading objects", percent);
        let _ = storage.set_progress(update.rev(), &progress.to_json());
    }
    Ok(())
}

/// Materialise the pending state on disk and arm the bootloader. The
/// sequence is fixed: state json, inline files, object links, boot
/// links, then the env write, which is the point of no return.
pub fn install(
    update: &mut Update,
    current: Option<&State>,
    storage: &RevisionStore,
    objects: &ObjectStore,
    bootenv: &mut BootEnv,
) -> Result<(), UpdateError> {
    let pending = &update.pending;
    let rev = pending.rev.clone();

    let stage = || -> Result<()> {
        storage.write_state(&rev, &pending.json)?;
        storage.write_pvr_config(&rev)?;
        storage.expand_inline_jsons(pending)?;
        for (path, id) in &pending.objects {
            objects
                .link_into(&storage.rev_dir(&rev).join(path), id)
                .with_context(|| format!("linking object {} into {}", id, path))?;
        }
        storage.link_boot_assets(pending)?;
        if let Some(msg) = &update.commitmsg {
            storage.write_commitmsg(&rev, msg)?;
        }
        Ok(())
    };
    stage().map_err(UpdateError::Transient)?;

    update.runlevel = update_runlevel(current, pending);
    bootenv
        .set_try(&rev)
        .context("arming trial boot")
        .map_err(UpdateError::Fatal)?;
    update.status = UpdateStatus::Installed;
    let progress = update.progress("installed, awaiting boot", 90);
    let _ = storage.set_progress(&rev, &progress.to_json());
    info!("installed revision {} at runlevel {}", rev, update.runlevel);
    Ok(())
}

/// Whether committing this update needs a reboot: any BSP asset changed,
/// or an affected platform sits at the data runlevel.
pub fn requires_reboot(update: &Update, current: Option<&State>) -> bool {
    if bsp_changed(current, &update.pending) {
        return true;
    }
    update.runlevel <= Runlevel::Data
}

/// Transition a resumed trial boot into its probation window.
pub fn test(update: &mut Update) {
    if update.status == UpdateStatus::Trying {
        update.status = UpdateStatus::Testing;
        debug!("revision {} entered testing", update.rev());
    }
}

/// Commit a surviving update: promote the revision to known-good and
/// disarm the one-shot.
pub fn finish_ok(
    update: &mut Update,
    storage: &RevisionStore,
    bootenv: &mut BootEnv,
) -> Result<()> {
    let rev = update.rev().to_string();
    bootenv.set_rev(&rev).context("promoting revision")?;
    bootenv.clear_try().context("disarming trial boot")?;
    update.status = UpdateStatus::Done;
    let progress = StepProgress::new("DONE", "update finished", 100);
    storage.set_progress(&rev, &progress.to_json())?;
    info!("revision {} committed", rev);
    Ok(())
}

/// Mark an update failed. The caller decides whether a rollback reboot
/// follows; the bootloader env is left alone so the firmware keeps the
/// last known-good revision.
pub fn finish_failed(update: &mut Update, storage: &RevisionStore, msg: &str) {
    update.status = UpdateStatus::Failed;
    let status = if update.integrity_failure {
        "WONTGO"
    } else {
        "ERROR"
    };
    let progress = StepProgress::new(status, msg, 0);
    let _ = storage.set_progress(update.rev(), &progress.to_json());
    warn!("update to revision {} failed: {}", update.rev(), msg);
}

/// The hub-facing progress record for a finished update.
pub fn final_progress(update: &Update) -> StepProgress {
    match update.status {
        UpdateStatus::Done => StepProgress::new("DONE", "update finished", 100),
        UpdateStatus::Failed if update.integrity_failure => {
            StepProgress::new("WONTGO", "objects could not be verified", 0)
        }
        UpdateStatus::Failed => StepProgress::new("ERROR", "update failed", 0),
        status => StepProgress::new(status.as_str(), "update in progress", 50),
    }
}

/// Accept a hand-delivered revision, bypassing the hub. The payload is
/// either the name of a revision already on disk, or an inline document
/// `{"rev": "locals/<name>", "state": {...}}` to be written first.
pub fn install_local(
    payload: &str,
    storage: &RevisionStore,
    config: &Config,
) -> Result<Update> {
    let payload = payload.trim();
    let (rev, json) = if payload.starts_with('{') {
        let doc: Value = serde_json::from_str(payload).context("parsing local install")?;
        let rev = doc
            .get("rev")
            .and_then(Value::as_str)
            .context("local install document has no rev")?
            .to_string();
        if !is_revision_local(&rev) && rev != crate::storage::FACTORY_REV {
            bail!("local revision name '{}' is not valid", rev);
        }
        let state = doc
            .get("state")
            .filter(|s| s.is_object())
            .context("local install document has no state")?;
        let json = state.to_string();
        storage.write_state(&rev, &json)?;
        (rev, json)
    } else {
        let rev = payload.to_string();
        let json = storage
            .read_state_json(&rev)
            .with_context(|| format!("loading local revision {}", rev))?;
        (rev, json)
    };

    if !crate::signature::verify(&json, config.secureboot_mode) {
        bail!("state signature verification failed for local revision {}", rev);
    }
    let state = State::parse(&json, &rev)?;
    let mut update = Update::new(state, true);
    update.status = UpdateStatus::Queued;
    Ok(update)
}

fn bsp_asset_id<'a>(state: &'a State, asset: Option<&str>) -> Option<&'a str> {
    let asset = asset?;
    let path = format!("{}{}", state.spec.bsp_prefix(), asset);
    state.objects.get(&path).map(String::as_str)
}

fn bsp_changed(current: Option<&State>, pending: &State) -> bool {
    let current = match current {
        Some(c) => c,
        // nothing to compare against: be conservative
        None => return true,
    };
    let assets = |s: &State| {
        [
            s.bsp.kernel.clone(),
            s.bsp.initrd.clone(),
            s.bsp.fdt.clone().unwrap_or_default(),
            s.bsp.firmware.clone().unwrap_or_default(),
        ]
    };
    for (cur_asset, new_asset) in assets(current).iter().zip(assets(pending).iter()) {
        let cur_id = bsp_asset_id(current, Some(cur_asset));
        let new_id = bsp_asset_id(pending, Some(new_asset));
        if cur_asset != new_asset || cur_id != new_id {
            return true;
        }
    }
    false
}

/// Runlevel of the update: the minimum across platforms whose definition
/// changed, or data level when the BSP itself changed.
fn update_runlevel(current: Option<&State>, pending: &State) -> Runlevel {
    if bsp_changed(current, pending) {
        return Runlevel::Data;
    }
    let current = match current {
        Some(c) => c,
        None => return Runlevel::Data,
    };
    let affected: Vec<&str> = pending
        .platforms
        .iter()
        .filter(|p| {
            current
                .platforms
                .iter()
                .find(|c| c.name == p.name)
                .map(|c| c.json != p.json)
                .unwrap_or(true)
        })
        .map(|p| p.name.as_str())
        .collect();
    pending.min_runlevel(affected)
}
