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

//! Process arguments and boot-cmdline tokens. When running as init the
//! interesting flags arrive as bare kernel tokens (`pv_standalone`,
//! `debug`, `pv_*=`/`ph_*=` overrides) rather than dashed options.

use clap::Parser;
use std::path::PathBuf;

/// Token marking a non-init helper run: skip pid-1 duties and run the
/// controller in-process.
pub const TOKEN_STANDALONE: &str = "pv_standalone";
/// Token used internally for the supervised agent child.
pub const TOKEN_AGENT: &str = "pv_agent";
/// Token enabling the debug shell and telnet gates.
pub const TOKEN_DEBUG: &str = "debug";

#[derive(Debug, Clone, Parser)]
#[clap(name = "pantavisor", version)]
#[clap(about = "Device-side agent managing atomic containerised revisions")]
pub struct Args {
    /// Print the supported state formats and bootloader back-ends, then
    /// exit.
    #[clap(long)]
    pub manifest: bool,
    /// Factory config file location.
    #[clap(long = "config", value_parser)]
    pub config_path: Option<PathBuf>,
    /// Hint directory (defaults to /pv).
    #[clap(long = "pv-dir", value_parser, hide = true)]
    pub pv_dir: Option<PathBuf>,
    /// Raw boot tokens.
    #[clap(value_parser)]
    pub tokens: Vec<String>,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    fn has_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    pub fn standalone(&self) -> bool {
        self.has_token(TOKEN_STANDALONE)
    }

    pub fn agent(&self) -> bool {
        self.has_token(TOKEN_AGENT)
    }

    pub fn debug(&self) -> bool {
        self.has_token(TOKEN_DEBUG)
    }

    /// Config overrides carried by `pv_`/`ph_` prefixed tokens.
    pub fn overrides(&self) -> Vec<(String, String)> {
        crate::config::cmdline_overrides(&self.tokens)
    }

    /// Fold in the kernel cmdline; pid-1 flags usually arrive there
    /// rather than in argv.
    pub fn merge_kernel_cmdline(&mut self) {
        if let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") {
            self.merge_tokens(&cmdline);
        }
    }

    fn merge_tokens(&mut self, cmdline: &str) {
        for token in cmdline.split_whitespace() {
            if !self.tokens.iter().any(|t| t == token) {
                self.tokens.push(token.to_string());
            }
        }
    }
}

/// Body of `--manifest`.
pub fn manifest() -> String {
    format!(
        "state formats:\n  {}\n  {}\nbootloaders:\n  uboot\n  uboot-pvk\n  grub\n",
        crate::state::SPEC_MULTI1,
        crate::state::SPEC_SYSTEM1
    )
}
