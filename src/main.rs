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

use nix::errno::Errno;
use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::wait::waitpid;
use nix::unistd::{sync, Pid};
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use libpantavisor::cmdline::{manifest, Args, TOKEN_AGENT};
use libpantavisor::init;

fn main() {
    let args = Args::parse_args();
    if args.manifest {
        print!("{}", manifest());
        return;
    }

    let pid1 = std::process::id() == 1;
    if pid1 && !args.standalone() && !args.agent() {
        run_init(args);
    }

    // non-init helper run, or the supervised agent child: the controller
    // runs in-process. Helpers must never issue reboot(2); the agent may.
    let standalone = !args.agent();
    std::process::exit(run_agent(&args, standalone));
}

fn run_agent(args: &Args, standalone: bool) -> i32 {
    match init::execute(args, standalone) {
        Ok(mut controller) => controller.run(),
        Err(e) => {
            eprintln!("Error: {:?}", e);
            1
        }
    }
}

/// Pid-1 duties: early mounts, debug gates, then supervise the agent
/// child and reap orphans forever. A dying agent ends in a reboot; init
/// itself never exits.
fn run_init(mut args: Args) -> ! {
    if let Err(e) = init::early_mounts() {
        eprintln!("Error: could not set up early mounts: {:?}", e);
        fatal_reboot();
    }
    args.merge_kernel_cmdline();
    if args.debug() {
        spawn_debug_gates();
    }

    let agent_pid = match spawn_agent(&args) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("Error: could not spawn agent: {:?}", e);
            fatal_reboot();
        }
    };

    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => {
                if status.pid() == Some(agent_pid) {
                    eprintln!("agent exited ({:?}), rebooting", status);
                    sleep(Duration::from_secs(10));
                    sync();
                    let _ = reboot(RebootMode::RB_AUTOBOOT);
                }
                // other children are container workloads and loggers;
                // reaping them here is all init owes them
            }
            Err(Errno::ECHILD) => sleep(Duration::from_secs(1)),
            Err(_) => sleep(Duration::from_secs(1)),
        }
    }
}

fn spawn_agent(args: &Args) -> std::io::Result<Pid> {
    let mut cmd = Command::new("/proc/self/exe");
    cmd.arg(TOKEN_AGENT);
    for token in &args.tokens {
        if token != TOKEN_AGENT {
            cmd.arg(token);
        }
    }
    let child = cmd.spawn()?;
    Ok(Pid::from_raw(child.id() as i32))
}

/// Best-effort debug access for development images.
fn spawn_debug_gates() {
    for gate in [
        &["ifconfig", "lo", "up"][..],
        &["telnetd", "-b", "127.0.0.1", "-l", "/bin/sh"][..],
    ] {
        if let Err(e) = Command::new(gate[0]).args(&gate[1..]).spawn() {
            eprintln!("debug gate {:?} not available: {}", gate[0], e);
        }
    }
}

fn fatal_reboot() -> ! {
    sync();
    sleep(Duration::from_secs(5));
    let _ = reboot(RebootMode::RB_AUTOBOOT);
    // reboot(2) failing leaves nothing sensible to do but spin
    loop {
        sleep(Duration::from_secs(60));
    }
}
