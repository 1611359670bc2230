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

//! The top-level state machine: boot, run, wait/poll, update, rollback,
//! reboot. One tick at a time, watchdog kicked per tick.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bootloader::BootEnv;
use crate::config::Config;
use crate::ctrl::{CtrlCmd, CtrlSocket};
use crate::hub::{Hub, Ownership, StepProgress};
use crate::metadata::{
    MetadataStore, DEVMETA_KEY_CLAIMED, DEVMETA_KEY_ONLINE, DEVMETA_KEY_PH_STATE,
};
use crate::objects::ObjectStore;
use crate::runtime::{PlatformRuntime, VolumeManager};
use crate::state::{Runlevel, State};
use crate::storage::{GcPins, RevisionStore, FACTORY_REV};
use crate::updater::{self, Update, UpdateError, UpdateStatus};
use crate::wdt::Watchdog;

/// Bound on the per-tick control socket drain.
const CTRL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvState {
    Init,
    Run,
    Wait,
    Command,
    Update,
    Rollback,
    Reboot,
    Poweroff,
    Error,
    Exit,
    FactoryUpload,
}

/// Hub-facing lifecycle published as `pantahub.state` device metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhState {
    Init,
    Register,
    Claim,
    Sync,
    Idle,
    Update,
}

impl PhState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Register => "register",
            Self::Claim => "claim",
            Self::Sync => "sync",
            Self::Idle => "idle",
            Self::Update => "update",
        }
    }
}

/// Factory progress milestones written to `trails/0/.pv/progress` during
/// the unclaimed flow.
fn factory_progress(stage: &str) -> StepProgress {
    let percent = match stage {
        "unregistered" => 0,
        "unclaimed" => 25,
        "syncing" => 50,
        "done" => 100,
        _ => 0,
    };
    StepProgress::new(stage, "factory revision progress", percent)
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

pub struct Controller {
    pub config: Config,
    storage: RevisionStore,
    objects: ObjectStore,
    bootenv: BootEnv,
    meta: MetadataStore,
    hub: Option<Hub>,
    ctrl: Option<CtrlSocket>,
    runtime: Box<dyn PlatformRuntime>,
    volumes: Box<dyn VolumeManager>,
    wdt: Option<Watchdog>,
    pv_dir: PathBuf,
    /// Never invoke reboot(2); return Exit instead. Set for non-pid-1
    /// runs.
    standalone: bool,

    state: Option<State>,
    update: Option<Update>,
    pending_cmd: Option<CtrlCmd>,
    unclaimed: bool,
    remote_mode: bool,
    synced: bool,
    online: bool,
    factory_meta_done: bool,
    /// Non-reboot update handing over to RUN.
    transitioning: bool,

    wait_deadline: Instant,
    commit_deadline: Option<Instant>,
    rollback_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
}

#[allow(clippy::too_many_arguments)]
impl Controller {
    pub fn new(
        config: Config,
        storage: RevisionStore,
        objects: ObjectStore,
        bootenv: BootEnv,
        meta: MetadataStore,
        hub: Option<Hub>,
        ctrl: Option<CtrlSocket>,
        runtime: Box<dyn PlatformRuntime>,
        volumes: Box<dyn VolumeManager>,
        wdt: Option<Watchdog>,
        pv_dir: PathBuf,
        standalone: bool,
    ) -> Self {
        let unclaimed = !config.is_claimed();
        Self {
            config,
            storage,
            objects,
            bootenv,
            meta,
            hub,
            ctrl,
            runtime,
            volumes,
            wdt,
            pv_dir,
            standalone,
            state: None,
            update: None,
            pending_cmd: None,
            unclaimed,
            remote_mode: false,
            synced: false,
            online: false,
            factory_meta_done: false,
            transitioning: false,
            wait_deadline: Instant::now(),
            commit_deadline: None,
            rollback_deadline: None,
            retry_deadline: None,
        }
    }

    /// Drive the machine until it exits. The return value is the process
    /// exit code for non-pid-1 invocations.
    pub fn run(&mut self) -> i32 {
        let mut state = PvState::Init;
        loop {
            debug!("going to state {:?}", state);
            if let Some(wdt) = &mut self.wdt {
                wdt.kick();
            }
            state = match state {
                PvState::Init => self.do_init(),
                PvState::Run => self.do_run(),
                PvState::Wait => self.do_wait(),
                PvState::Command => self.do_command(),
                PvState::Update => self.do_update(),
                PvState::Rollback => self.do_rollback(),
                PvState::Reboot => self.do_shutdown(false),
                PvState::Poweroff => self.do_shutdown(true),
                PvState::Error => self.do_error(),
                PvState::FactoryUpload => self.do_factory_upload(),
                PvState::Exit => return if self.standalone { 0 } else { 1 },
            };
        }
    }

    fn do_init(&mut self) -> PvState {
        // components were built by the init dispatcher; nothing left but
        // to enter the machine
        PvState::Run
    }

    fn do_run(&mut self) -> PvState {
        match self.try_run() {
            Ok(()) => PvState::Wait,
            Err(e) => {
                error!("could not bring revision up: {:#}", e);
                PvState::Rollback
            }
        }
    }

    fn try_run(&mut self) -> Result<()> {
        let run_from;
        if self.transitioning {
            // non-reboot update: adopt the pending state in place
            self.transitioning = false;
            let update = self
                .update
                .as_ref()
                .context("transitioning without an update")?;
            info!("transitioning to revision {}", update.rev());
            self.state = Some(update.pending.clone());
            run_from = update.runlevel;
        } else {
            let resumed = updater::resume(&self.storage, &mut self.bootenv)?;
            if let Some(update) = resumed.update {
                self.update = Some(update);
            }
            let rev = resumed.boot_rev;
            let json = self.storage.read_state_json(&rev)?;
            if !crate::signature::verify(&json, self.config.secureboot_mode) {
                anyhow::bail!("state signature verification failed");
            }
            self.state = Some(State::parse(&json, &rev)?);
            run_from = Runlevel::Data;
        }

        let state = self.state.as_ref().expect("state was just loaded");
        self.storage.set_active(&state.rev)?;
        state.validate_checksums(&self.storage.rev_dir(&state.rev))?;

        if state.rev == FACTORY_REV {
            let _ = self
                .storage
                .set_progress(FACTORY_REV, &factory_progress("unregistered").to_json());
        }

        // local revisions force local mode regardless of config
        self.remote_mode = self.config.control_remote && !state.local;
        if self.remote_mode {
            self.meta
                .add_devmeta(DEVMETA_KEY_PH_STATE, PhState::Init.as_str());
        } else {
            info!("running in local mode, not consuming updates from the hub");
        }

        self.storage.write_pvr_config(&state.rev)?;
        let rev = state.rev.clone();
        let remote_mode = self.remote_mode;
        self.meta.init_devmeta(&rev, remote_mode);
        self.meta.load_cached_usermeta(&mut self.config);
        self.meta.add_devmeta(
            DEVMETA_KEY_CLAIMED,
            if self.unclaimed { "0" } else { "1" },
        );

        let state = self.state.as_ref().expect("state was just loaded");
        info!("starting revision {} from runlevel {}", state.rev, run_from);
        self.volumes
            .mount(state, run_from)
            .context("mounting volumes")?;
        self.runtime
            .start(state, run_from)
            .context("starting platforms")?;

        self.wait_deadline = Instant::now();
        self.commit_deadline = None;
        if self.update.as_ref().map(|u| u.is_trying()).unwrap_or(false) {
            self.rollback_deadline = Some(
                Instant::now()
                    + Duration::from_secs(self.config.updater.network_timeout as u64),
            );
        }
        Ok(())
    }

    fn do_wait(&mut self) -> PvState {
        // a dead platform tears the revision down
        if let Some(state) = &self.state {
            if self.runtime.check_exited(state) {
                error!("one or more platforms exited, tearing down");
                let probation = self
                    .update
                    .as_ref()
                    .map(|u| u.is_trying() || u.is_testing())
                    .unwrap_or(false);
                return if probation {
                    PvState::Rollback
                } else {
                    PvState::Reboot
                };
            }
        }

        let mut next = PvState::Wait;
        // network work is gated on remote mode; an unclaimed device first
        // finishes any in-flight update (the make-factory flow)
        if self.remote_mode && (!self.unclaimed || self.update.is_none()) {
            if Instant::now() >= self.wait_deadline {
                self.wait_deadline = Instant::now()
                    + Duration::from_secs(self.config.updater.interval as u64);
                next = if self.unclaimed {
                    self.wait_unclaimed()
                } else {
                    self.wait_network()
                };
            }
        } else {
            next = self.wait_update();
        }
        if next != PvState::Wait {
            return next;
        }

        self.meta
            .add_devmeta(DEVMETA_KEY_ONLINE, if self.online { "1" } else { "0" });

        if self.storage.gc_threshold_reached(&self.config.storage.gc) {
            self.run_gc();
        }

        // drain at most one command per tick; the bounded poll also paces
        // the loop
        if self.ctrl.is_none() {
            std::thread::sleep(CTRL_DRAIN_TIMEOUT);
        }
        if let Some(ctrl) = &self.ctrl {
            if let Some(request) = ctrl.wait(CTRL_DRAIN_TIMEOUT) {
                let cmd = request.cmd.clone();
                // queries are answered inline without a state change
                if cmd == CtrlCmd::ListRevisions {
                    match self.storage.revisions_json() {
                        Ok(body) => request.respond(&body),
                        Err(e) => request.respond_err(&format!("{:#}", e)),
                    }
                    return PvState::Wait;
                }
                match self.command_precheck(&cmd) {
                    Ok(()) => {
                        request.respond_ok();
                        self.pending_cmd = Some(cmd);
                        return PvState::Command;
                    }
                    Err(reason) => {
                        warn!("rejecting command: {}", reason);
                        request.respond_err(&reason);
                    }
                }
            }
        }

        PvState::Wait
    }

    /// Rejection rules applied before a command is acted on.
    fn command_precheck(&self, cmd: &CtrlCmd) -> Result<(), String> {
        let update_in_progress = self
            .update
            .as_ref()
            .map(|u| u.in_progress())
            .unwrap_or(false);
        match cmd {
            CtrlCmd::Reboot(_)
            | CtrlCmd::Poweroff(_)
            | CtrlCmd::LocalRun(_)
            | CtrlCmd::MakeFactory(_)
                if update_in_progress =>
            {
                Err("an update is in progress".to_string())
            }
            CtrlCmd::MakeFactory(_) if !self.unclaimed => {
                Err("device is already claimed".to_string())
            }
            _ => Ok(()),
        }
    }

    fn do_command(&mut self) -> PvState {
        let cmd = match self.pending_cmd.take() {
            Some(cmd) => cmd,
            None => return PvState::Wait,
        };
        match self.handle_command(cmd) {
            Ok(next) => next,
            Err(e) => {
                warn!("command failed: {:#}", e);
                PvState::Wait
            }
        }
    }

    fn handle_command(&mut self, cmd: CtrlCmd) -> Result<PvState> {
        match cmd {
            CtrlCmd::UpdateMetadata(payload) => {
                if self.remote_mode {
                    debug!("parsing device metadata from command");
                    let value: serde_json::Value =
                        serde_json::from_str(&payload).context("parsing metadata")?;
                    if let Some(map) = value.as_object() {
                        for (key, value) in map {
                            let value = match value.as_str() {
                                Some(s) => s.to_string(),
                                None => value.to_string(),
                            };
                            self.meta.add_devmeta(key, &value);
                        }
                    }
                }
                Ok(PvState::Wait)
            }
            CtrlCmd::Reboot(msg) => {
                info!("reboot requested: '{}'", msg);
                Ok(PvState::Reboot)
            }
            CtrlCmd::Poweroff(msg) => {
                info!("poweroff requested: '{}'", msg);
                Ok(PvState::Poweroff)
            }
            CtrlCmd::LocalRun(payload) => {
                let update = updater::install_local(&payload, &self.storage, &self.config)
                    .context("accepting local install")?;
                info!("local install of revision {}", update.rev());
                self.update = Some(update);
                Ok(PvState::Update)
            }
            CtrlCmd::MakeFactory(payload) => {
                let src_rev = if payload.is_empty() {
                    self.state
                        .as_ref()
                        .map(|s| s.rev.clone())
                        .context("no running state")?
                } else {
                    payload
                };
                info!("transferring revision {} to factory revision", src_rev);
                self.storage
                    .update_factory(&src_rev)
                    .context("updating factory revision")?;
                let update =
                    updater::install_local(FACTORY_REV, &self.storage, &self.config)?;
                self.update = Some(update);
                Ok(PvState::Update)
            }
            CtrlCmd::RunGc => {
                self.run_gc();
                Ok(PvState::Wait)
            }
            CtrlCmd::ListRevisions => {
                // the listing was already answered inline by do_wait's
                // responder; nothing changes machine state
                Ok(PvState::Wait)
            }
        }
    }

    fn run_gc(&mut self) -> u64 {
        let pins = GcPins {
            running: self.state.as_ref().map(|s| s.rev.as_str()),
            pending: self.update.as_ref().map(|u| &u.pending),
            boot_rev: Some(self.bootenv.get_rev()),
            keep_factory: self.config.storage.gc.keep_factory,
        };
        match self.storage.gc_run(&self.objects, &pins) {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                warn!("garbage collection failed: {:#}", e);
                0
            }
        }
    }

    fn wait_unclaimed(&mut self) -> PvState {
        let _ = self.config.load_creds();

        let hub = match self.hub.as_mut() {
            Some(hub) => hub,
            None => return PvState::Wait,
        };

        let registered =
            !self.config.creds.id.is_empty() && hub.device_exists(&self.config);
        if !registered {
            self.meta
                .add_devmeta(DEVMETA_KEY_PH_STATE, PhState::Register.as_str());
            let hub = self.hub.as_mut().expect("hub checked above");
            if let Err(e) = hub.register_self(&mut self.config) {
                warn!("registration failed: {:#}", e);
                hub.release();
                return PvState::Wait;
            }
            if let Err(e) = self.config.save_creds() {
                warn!("could not persist credentials: {:#}", e);
            }
            self.hub.as_mut().expect("hub checked above").release();
        }

        let hub = self.hub.as_mut().expect("hub checked above");
        match hub.device_owned(&self.config) {
            Ok(Ownership::Unclaimed { challenge }) => {
                self.meta
                    .add_devmeta(DEVMETA_KEY_PH_STATE, PhState::Claim.as_str());
                let _ = self.storage.set_progress(
                    FACTORY_REV,
                    &factory_progress("unclaimed").to_json(),
                );
                info!("device challenge: '{}'", challenge);
                crate::hub::update_claim_hints(
                    &self.pv_dir,
                    &self.config,
                    Some(&challenge),
                );
                self.online = true;
            }
            Ok(Ownership::Owned) => {
                self.meta
                    .add_devmeta(DEVMETA_KEY_PH_STATE, PhState::Sync.as_str());
                let _ = self
                    .storage
                    .set_progress(FACTORY_REV, &factory_progress("syncing").to_json());
                info!("device has been claimed, proceeding normally");
                self.unclaimed = false;
                self.online = true;
                if let Err(e) = self.config.save_creds() {
                    warn!("could not persist credentials: {:#}", e);
                }
                self.hub.as_mut().expect("hub checked above").release();
                crate::hub::update_claim_hints(&self.pv_dir, &self.config, None);
                self.meta.add_devmeta(DEVMETA_KEY_CLAIMED, "1");
            }
            Err(e) => {
                debug!("claim check failed: {:#}", e);
                self.online = false;
                return PvState::Wait;
            }
        }

        PvState::FactoryUpload
    }

    fn do_factory_upload(&mut self) -> PvState {
        if self.factory_meta_done {
            return PvState::Wait;
        }
        if self.unclaimed {
            // nothing to upload against yet
            return PvState::Wait;
        }
        let payload = match self.meta.devmeta_payload() {
            Some(payload) => payload,
            None => {
                self.factory_meta_done = true;
                return PvState::Wait;
            }
        };
        let hub = match self.hub.as_mut() {
            Some(hub) => hub,
            None => return PvState::Wait,
        };
        match hub.upload_devmeta(&self.config, &payload) {
            Ok(()) => {
                self.meta.mark_devmeta_uploaded();
                self.factory_meta_done = true;
                PvState::Wait
            }
            Err(e) => {
                warn!("factory metadata upload failed: {:#}", e);
                self.online = false;
                PvState::Wait
            }
        }
    }

    fn wait_network(&mut self) -> PvState {
        let hub = match self.hub.as_mut() {
            Some(hub) => hub,
            None => return self.wait_update(),
        };

        let device_body = match hub.get_device(&self.config) {
            Ok(body) => body,
            Err(e) => {
                debug!("hub unreachable: {:#}", e);
                self.online = false;
                return self.offline_tick();
            }
        };
        self.online = true;

        if let Err(e) = self.meta.parse_usermeta(&device_body, &mut self.config) {
            debug!("no user metadata consumed: {:#}", e);
        }

        if !self.factory_meta_done {
            return PvState::FactoryUpload;
        }

        // push dirty device metadata
        if let Some(payload) = self.meta.devmeta_payload() {
            let hub = self.hub.as_mut().expect("hub checked above");
            match hub.upload_devmeta(&self.config, &payload) {
                Ok(()) => self.meta.mark_devmeta_uploaded(),
                Err(e) => debug!("device metadata upload failed: {:#}", e),
            }
        }

        // look for a new remote update unless one is already in flight
        if self.update.is_none() {
            if let Some(next) = self.check_for_updates() {
                return next;
            }
        }

        if self.synced {
            self.meta
                .add_devmeta(DEVMETA_KEY_PH_STATE, PhState::Idle.as_str());
            if self.state.as_ref().map(|s| s.rev.as_str()) == Some(FACTORY_REV) {
                let _ = self
                    .storage
                    .set_progress(FACTORY_REV, &factory_progress("done").to_json());
            }
        }
        self.synced = true;

        self.wait_update()
    }

    /// A tick without connectivity: only probation bookkeeping happens.
    fn offline_tick(&mut self) -> PvState {
        let update = match &self.update {
            Some(update) => update,
            None => return PvState::Wait,
        };
        if update.is_trying() {
            if let Some(deadline) = self.rollback_deadline {
                if Instant::now() >= deadline {
                    error!("timed out before reaching the hub, rolling back");
                    return PvState::Rollback;
                }
                let left = deadline.saturating_duration_since(Instant::now());
                warn!("no connection, rolling back in {}s", left.as_secs());
            }
        } else if update.is_testing() {
            error!("connection not stable during testing, rolling back");
            return PvState::Rollback;
        }
        PvState::Wait
    }

    fn check_for_updates(&mut self) -> Option<PvState> {
        let current_rev = self.state.as_ref().map(|s| s.rev.clone())?;
        let hub = self.hub.as_mut()?;
        let steps = match hub.pending_steps(&self.config) {
            Ok(steps) => steps,
            Err(e) => {
                debug!("could not fetch trail steps: {:#}", e);
                return None;
            }
        };
        for step in steps {
            match updater::update_from_step(&step, &self.config, &current_rev) {
                Ok(Some(update)) => {
                    info!("hub advertises revision {}", update.rev());
                    self.meta
                        .add_devmeta(DEVMETA_KEY_PH_STATE, PhState::Update.as_str());
                    self.update = Some(update);
                    return Some(PvState::Update);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("rejecting advertised revision {}: {:#}", step.rev, e);
                    let progress =
                        StepProgress::new("WONTGO", "state rejected by device", 0);
                    let hub = self.hub.as_mut()?;
                    let _ = hub.put_progress(&self.config, &step.rev, &progress);
                    return None;
                }
            }
        }
        None
    }

    /// Progress any in-flight update through its probation and commit.
    fn wait_update(&mut self) -> PvState {
        let status = match &self.update {
            Some(update) => update.status,
            None => return PvState::Wait,
        };
        match status {
            UpdateStatus::Trying => {
                // begin probation
                self.commit_deadline = Some(
                    Instant::now()
                        + Duration::from_secs(self.config.updater.commit_delay as u64),
                );
                if let Some(update) = self.update.as_mut() {
                    updater::test(update);
                }
                PvState::Wait
            }
            UpdateStatus::Testing => {
                if let Some(deadline) = self.commit_deadline {
                    if Instant::now() < deadline {
                        let left = deadline.saturating_duration_since(Instant::now());
                        info!("committing new update in {} seconds", left.as_secs());
                        return PvState::Wait;
                    }
                }
                self.finish_update()
            }
            UpdateStatus::Installed => self.finish_update(),
            UpdateStatus::Queued => {
                // a retryable failure parked the update; fire when the
                // backoff elapses
                match self.retry_deadline {
                    Some(deadline) if Instant::now() >= deadline => PvState::Update,
                    None => PvState::Update,
                    _ => PvState::Wait,
                }
            }
            UpdateStatus::Failed => {
                self.report_update_progress();
                self.update = None;
                PvState::Wait
            }
            _ => PvState::Wait,
        }
    }

    fn finish_update(&mut self) -> PvState {
        let update = match self.update.as_mut() {
            Some(update) => update,
            None => return PvState::Wait,
        };
        match updater::finish_ok(update, &self.storage, &mut self.bootenv) {
            Ok(()) => {
                let rev = update.rev().to_string();
                self.meta.add_devmeta("pantavisor.revision", &rev);
                self.report_update_progress();
                self.update = None;
                self.commit_deadline = None;
                self.rollback_deadline = None;
                PvState::Wait
            }
            Err(e) => {
                error!("update could not be finished, rolling back: {:#}", e);
                PvState::Rollback
            }
        }
    }

    /// PUT the current update's progress to the hub. Local installs and
    /// unclaimed devices skip reporting.
    fn report_update_progress(&mut self) {
        let update = match &self.update {
            Some(update) => update,
            None => return,
        };
        if update.local || self.unclaimed {
            return;
        }
        let hub = match self.hub.as_mut() {
            Some(hub) => hub,
            None => return,
        };
        let progress = updater::final_progress(update);
        if let Err(e) = hub.put_progress(&self.config, update.rev(), &progress) {
            debug!("progress report failed: {:#}", e);
        }
    }

    fn do_update(&mut self) -> PvState {
        self.meta
            .add_devmeta(DEVMETA_KEY_PH_STATE, PhState::Update.as_str());
        self.retry_deadline = None;

        let result = self.download_and_install();
        match result {
            Ok(()) => {}
            Err(err) => return self.update_failed(err),
        }

        let requires_reboot = {
            let update = self.update.as_ref().expect("update just installed");
            updater::requires_reboot(update, self.state.as_ref())
        };
        if requires_reboot {
            return PvState::Reboot;
        }

        // runlevel-scoped restart without a reboot
        let runlevel = self.update.as_ref().expect("update exists").runlevel;
        info!("stopping runlevel {} and above", runlevel);
        if let Some(state) = &self.state {
            if self.runtime.stop(state, runlevel).is_err()
                || self.volumes.unmount(state, runlevel).is_err()
            {
                error!("could not stop platforms or unmount volumes, rolling back");
                return PvState::Rollback;
            }
        }
        self.transitioning = true;
        PvState::Run
    }

    fn download_and_install(&mut self) -> Result<(), UpdateError> {
        let update = self
            .update
            .as_mut()
            .ok_or_else(|| UpdateError::Fatal(anyhow::anyhow!("no update queued")))?;

        let mut hub = self.hub.as_mut();
        let config = &self.config;
        let mut fetch = |id: &str| -> Result<Box<dyn Read>> {
            match hub.as_deref_mut() {
                Some(hub) => {
                    let resp = hub.download_object(config, id)?;
                    Ok(Box::new(resp) as Box<dyn Read>)
                }
                None => anyhow::bail!("no hub client for object {}", id),
            }
        };
        updater::download(update, &self.objects, &self.storage, &mut fetch)?;
        updater::install(
            update,
            self.state.as_ref(),
            &self.storage,
            &self.objects,
            &mut self.bootenv,
        )
    }

    fn update_failed(&mut self, err: UpdateError) -> PvState {
        let retries = self.config.updater.revision_retries;
        let retry_timeout = self.config.updater.revision_retry_timeout;
        let update = match self.update.as_mut() {
            Some(update) => update,
            None => return PvState::Wait,
        };
        if err.is_integrity() {
            update.integrity_failure = true;
        }
        if !err.is_fatal() {
            update.retries += 1;
            if update.retries < retries {
                warn!(
                    "update attempt {}/{} failed: {:#}",
                    update.retries, retries, err
                );
                update.status = UpdateStatus::Queued;
                self.retry_deadline =
                    Some(Instant::now() + Duration::from_secs(retry_timeout as u64));
                return PvState::Wait;
            }
        }
        error!("update failed: {:#}", err);
        updater::finish_failed(update, &self.storage, &format!("{:#}", err));
        self.report_update_progress();
        self.update = None;
        PvState::Wait
    }

    fn do_rollback(&mut self) -> PvState {
        // a broken factory revision is unrecoverable
        if self.state.as_ref().map(|s| s.rev.as_str()) == Some(FACTORY_REV) {
            error!("factory revision misbehaving");
            return PvState::Error;
        }
        if let Some(update) = self.update.as_mut() {
            updater::finish_failed(update, &self.storage, "rolled back");
        }
        self.report_update_progress();
        self.update = None;
        PvState::Reboot
    }

    fn do_error(&mut self) -> PvState {
        PvState::Reboot
    }

    fn do_shutdown(&mut self, poweroff: bool) -> PvState {
        let verb = if poweroff { "powering off" } else { "rebooting" };
        info!("preparing {}", verb);

        if let Some(state) = &self.state {
            if let Err(e) = self.runtime.stop(state, Runlevel::Data) {
                warn!("stop error, ignoring while {}: {:#}", verb, e);
            }
            if let Err(e) = self.volumes.unmount(state, Runlevel::Data) {
                warn!("unmount error, ignoring while {}: {:#}", verb, e);
            }
        }

        if self.standalone {
            info!("standalone run, skipping {}", verb);
            return PvState::Exit;
        }

        let mnt = self.config.storage.mntpoint.clone();
        if let Err(e) = nix::mount::umount(&mnt) {
            warn!("could not unmount storage: {}", e);
        }
        nix::unistd::sync();
        info!("{}...", verb);
        let mode = if poweroff {
            nix::sys::reboot::RebootMode::RB_POWER_OFF
        } else {
            nix::sys::reboot::RebootMode::RB_AUTOBOOT
        };
        if let Err(e) = nix::sys::reboot::reboot(mode) {
            error!("reboot syscall failed: {}", e);
        }
        PvState::Exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootloaderType;
    use crate::metadata::MetadataStore;
    use crate::objects::sha256_hex;
    use crate::runtime::InertRuntime;
    use tempfile::TempDir;

    fn state_json() -> String {
        format!(
            r##"{{
  "#spec": "pantavisor-multi-platform@1",
  "pantavisor.json": {{"linux": "kernel.img", "initrd": "initrd.img",
                       "platforms": [], "volumes": [], "addons": []}},
  "kernel.img": "{}",
  "initrd.img": "{}"
}}"##,
            sha256_hex(b"kernel"),
            sha256_hex(b"initrd")
        )
    }

    fn controller() -> (TempDir, TempDir, Controller) {
        let mnt = TempDir::new().unwrap();
        let pv = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.mntpoint = mnt.path().to_path_buf();
        config.bl.typ = BootloaderType::UbootPlain;
        config.creds.prn = "prn:::devices:/x".to_string();

        let storage = RevisionStore::new(mnt.path());
        storage.ensure_layout().unwrap();
        let objects = ObjectStore::new(mnt.path(), true);
        let bootenv = BootEnv::open(&config).unwrap();
        let meta = MetadataStore::new(pv.path(), None);
        let controller = Controller::new(
            config,
            storage,
            objects,
            bootenv,
            meta,
            None,
            None,
            Box::new(InertRuntime),
            Box::new(InertRuntime),
            None,
            pv.path().to_path_buf(),
            true,
        );
        (mnt, pv, controller)
    }

    fn seed_running_state(controller: &mut Controller) {
        let json = state_json();
        controller.storage.write_state("10", &json).unwrap();
        let state = State::parse(&json, "10").unwrap();
        controller.state = Some(state);
    }

    #[test]
    fn test_command_precheck_rejects_during_update() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);

        let state = controller.state.clone().unwrap();
        let mut update = Update::new(state, false);
        update.status = UpdateStatus::Downloading;
        controller.update = Some(update);

        for cmd in [
            CtrlCmd::Reboot(String::new()),
            CtrlCmd::Poweroff(String::new()),
            CtrlCmd::LocalRun("locals/x".to_string()),
            CtrlCmd::MakeFactory(String::new()),
        ] {
            controller.command_precheck(&cmd).unwrap_err();
        }
        // metadata and gc stay allowed
        controller
            .command_precheck(&CtrlCmd::UpdateMetadata("{}".to_string()))
            .unwrap();
        controller.command_precheck(&CtrlCmd::RunGc).unwrap();

        // a finished update no longer blocks
        controller.update.as_mut().unwrap().status = UpdateStatus::Done;
        controller
            .command_precheck(&CtrlCmd::Reboot(String::new()))
            .unwrap();
    }

    #[test]
    fn test_make_factory_rejected_when_claimed() {
        let (_mnt, _pv, mut controller) = controller();
        controller.unclaimed = false;
        controller
            .command_precheck(&CtrlCmd::MakeFactory(String::new()))
            .unwrap_err();
        controller.unclaimed = true;
        controller
            .command_precheck(&CtrlCmd::MakeFactory(String::new()))
            .unwrap();
    }

    #[test]
    fn test_reboot_command_flow() {
        let (_mnt, _pv, mut controller) = controller();
        assert_eq!(
            controller
                .handle_command(CtrlCmd::Reboot("maintenance".to_string()))
                .unwrap(),
            PvState::Reboot
        );
        assert_eq!(
            controller
                .handle_command(CtrlCmd::Poweroff(String::new()))
                .unwrap(),
            PvState::Poweroff
        );
    }

    #[test]
    fn test_update_metadata_command() {
        let (_mnt, _pv, mut controller) = controller();
        controller.remote_mode = true;
        let next = controller
            .handle_command(CtrlCmd::UpdateMetadata(
                r#"{"sensor.temp": "42"}"#.to_string(),
            ))
            .unwrap();
        assert_eq!(next, PvState::Wait);
        assert_eq!(controller.meta.devmeta_get("sensor.temp"), Some("42"));
    }

    #[test]
    fn test_local_run_command_queues_update() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        let payload = serde_json::json!({
            "rev": "locals/dev1",
            "state": serde_json::from_str::<serde_json::Value>(&state_json()).unwrap(),
        })
        .to_string();

        let next = controller
            .handle_command(CtrlCmd::LocalRun(payload))
            .unwrap();
        assert_eq!(next, PvState::Update);
        let update = controller.update.as_ref().unwrap();
        assert!(update.local);
        assert_eq!(update.rev(), "locals/dev1");
    }

    #[test]
    fn test_make_factory_copies_state() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        controller.unclaimed = true;

        let next = controller
            .handle_command(CtrlCmd::MakeFactory("10".to_string()))
            .unwrap();
        assert_eq!(next, PvState::Update);
        assert_eq!(controller.update.as_ref().unwrap().rev(), "0");
        // the factory state is a copy of revision 10
        assert_eq!(
            controller.storage.read_state_json("0").unwrap(),
            controller.storage.read_state_json("10").unwrap()
        );
    }

    #[test]
    fn test_probation_commit_flow() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        controller.storage.write_state("11", &state_json()).unwrap();
        controller.bootenv.set_rev("10").unwrap();
        controller.bootenv.set_try("11").unwrap();

        let state = State::parse(&state_json(), "11").unwrap();
        let mut update = Update::new(state, false);
        update.status = UpdateStatus::Trying;
        controller.update = Some(update);
        controller.config.updater.commit_delay = 0;

        // first pass arms probation
        assert_eq!(controller.wait_update(), PvState::Wait);
        assert!(controller.update.as_ref().unwrap().is_testing());

        // zero commit delay: next pass commits
        assert_eq!(controller.wait_update(), PvState::Wait);
        assert!(controller.update.is_none());
        assert_eq!(controller.bootenv.get_rev(), "11");
        assert_eq!(controller.bootenv.get_try(), None);
    }

    #[test]
    fn test_probation_waits_out_commit_delay() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        let state = State::parse(&state_json(), "11").unwrap();
        let mut update = Update::new(state, false);
        update.status = UpdateStatus::Trying;
        controller.update = Some(update);
        controller.config.updater.commit_delay = 3600;

        assert_eq!(controller.wait_update(), PvState::Wait);
        // still testing: the deadline is an hour out
        assert_eq!(controller.wait_update(), PvState::Wait);
        assert!(controller.update.as_ref().unwrap().is_testing());
        assert_eq!(controller.bootenv.get_rev(), "0");
    }

    #[test]
    fn test_offline_probation_rolls_back_on_timeout() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        let state = State::parse(&state_json(), "11").unwrap();
        let mut update = Update::new(state, false);
        update.status = UpdateStatus::Trying;
        controller.update = Some(update);

        // deadline in the future: keep waiting
        controller.rollback_deadline = Some(Instant::now() + Duration::from_secs(60));
        assert_eq!(controller.offline_tick(), PvState::Wait);

        // deadline passed: roll back
        controller.rollback_deadline = Some(Instant::now() - Duration::from_secs(1));
        assert_eq!(controller.offline_tick(), PvState::Rollback);

        // testing with lost connectivity rolls back immediately
        controller.update.as_mut().unwrap().status = UpdateStatus::Testing;
        controller.rollback_deadline = None;
        assert_eq!(controller.offline_tick(), PvState::Rollback);
    }

    #[test]
    fn test_rollback_on_factory_is_error() {
        let (_mnt, _pv, mut controller) = controller();
        let json = state_json();
        controller.storage.write_state("0", &json).unwrap();
        controller.state = Some(State::parse(&json, "0").unwrap());
        assert_eq!(controller.do_rollback(), PvState::Error);
        assert_eq!(controller.do_error(), PvState::Reboot);
    }

    #[test]
    fn test_rollback_reports_failure() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        controller.storage.write_state("11", &state_json()).unwrap();
        let state = State::parse(&state_json(), "11").unwrap();
        let mut update = Update::new(state, false);
        update.status = UpdateStatus::Testing;
        controller.update = Some(update);

        assert_eq!(controller.do_rollback(), PvState::Reboot);
        assert!(controller.update.is_none());
        assert!(controller
            .storage
            .read_progress("11")
            .unwrap()
            .contains("ERROR"));
    }

    #[test]
    fn test_retry_backoff_parks_update() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        let state = State::parse(&state_json(), "11").unwrap();
        controller.update = Some(Update::new(state, false));
        controller.config.updater.revision_retries = 3;
        controller.config.updater.revision_retry_timeout = 3600;

        let next = controller
            .update_failed(UpdateError::Transient(anyhow::anyhow!("flaky network")));
        assert_eq!(next, PvState::Wait);
        let update = controller.update.as_ref().unwrap();
        assert_eq!(update.status, UpdateStatus::Queued);
        assert_eq!(update.retries, 1);
        // backoff not elapsed: the update stays parked
        assert_eq!(controller.wait_update(), PvState::Wait);

        // exhausting retries fails the update
        controller
            .update_failed(UpdateError::Transient(anyhow::anyhow!("still flaky")));
        let next = controller
            .update_failed(UpdateError::Transient(anyhow::anyhow!("dead network")));
        assert_eq!(next, PvState::Wait);
        assert!(controller.update.is_none());
    }

    #[test]
    fn test_integrity_exhaustion_marks_wontgo() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        controller.storage.write_state("12", &state_json()).unwrap();
        let state = State::parse(&state_json(), "12").unwrap();
        controller.update = Some(Update::new(state, false));
        controller.config.updater.revision_retries = 1;

        let next = controller
            .update_failed(UpdateError::Integrity(anyhow::anyhow!("sha mismatch")));
        assert_eq!(next, PvState::Wait);
        assert!(controller.update.is_none());
        assert!(controller
            .storage
            .read_progress("12")
            .unwrap()
            .contains("WONTGO"));
    }

    #[test]
    fn test_run_resumes_trial_boot() {
        let (_mnt, _pv, mut controller) = controller();
        let json = state_json();
        controller.storage.write_state("10", &json).unwrap();
        controller.storage.write_state("11", &json).unwrap();
        // place the objects so checksum validation passes
        for rev in ["10", "11"] {
            let state = State::parse(&json, rev).unwrap();
            controller.objects.ensure_dirs().unwrap();
            for (path, id) in &state.objects {
                let data: &[u8] = if path.starts_with("kernel") {
                    b"kernel"
                } else {
                    b"initrd"
                };
                let _ = controller.objects.put(id, &mut &data[..]);
                controller
                    .objects
                    .link_into(&controller.storage.rev_dir(rev).join(path), id)
                    .unwrap();
            }
        }
        controller.bootenv.set_rev("10").unwrap();
        controller.bootenv.set_try("11").unwrap();

        assert_eq!(controller.do_run(), PvState::Wait);
        assert_eq!(controller.state.as_ref().unwrap().rev, "11");
        let update = controller.update.as_ref().unwrap();
        assert!(update.is_trying());
        // trial boot arms the network-timeout rollback
        assert!(controller.rollback_deadline.is_some());
        assert_eq!(controller.storage.current_rev().as_deref(), Some("11"));
        // local mode is off for remote revisions
        assert!(controller.remote_mode);
    }

    #[test]
    fn test_run_local_revision_disables_remote(){
        let (_mnt, _pv, mut controller) = controller();
        let json = state_json();
        controller.storage.write_state("locals/dev1", &json).unwrap();
        let state = State::parse(&json, "locals/dev1").unwrap();
        controller.objects.ensure_dirs().unwrap();
        for (path, id) in &state.objects {
            let data: &[u8] = if path.starts_with("kernel") {
                b"kernel"
            } else {
                b"initrd"
            };
            let _ = controller.objects.put(id, &mut &data[..]);
            controller
                .objects
                .link_into(
                    &controller.storage.rev_dir("locals/dev1").join(path),
                    id,
                )
                .unwrap();
        }
        let mut update = Update::new(state, true);
        update.status = UpdateStatus::Installed;
        controller.update = Some(update);
        controller.transitioning = true;

        assert_eq!(controller.do_run(), PvState::Wait);
        assert!(!controller.remote_mode);
        assert!(controller.state.as_ref().unwrap().local);
    }

    #[test]
    fn test_shutdown_standalone_exits() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        assert_eq!(controller.do_shutdown(false), PvState::Exit);
        assert_eq!(controller.do_shutdown(true), PvState::Exit);
    }

    #[test]
    fn test_gc_command_runs() {
        let (_mnt, _pv, mut controller) = controller();
        seed_running_state(&mut controller);
        controller.storage.write_state("5", "{}").unwrap();
        assert_eq!(controller.handle_command(CtrlCmd::RunGc).unwrap(), PvState::Wait);
        // unpinned revision 5 was collected
        assert_eq!(controller.storage.list_revs().unwrap(), vec!["10"]);
    }
}
