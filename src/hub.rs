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

//! Blocking client for the hub API: device registration and claim,
//! trail steps, progress reporting, object downloads and device
//! metadata upload.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::fs::read_dir;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;

/// Completion timeout for HTTP requests (1 hour); object downloads on
/// slow links dominate.
const HTTP_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Directory holding the CA certificates trusted for hub TLS.
const CERTS_DIR: &str = "/certs";

// this matches `curl --retry` semantics -- see list in `curl(1)`
const RETRY_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Progress record PUT to `/trails/<prn>/steps/<rev>/progress` and
/// mirrored into the revision's progress sidecar.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepProgress {
    pub status: String,
    #[serde(rename = "status-msg")]
    pub status_msg: String,
    pub progress: u32,
}

impl StepProgress {
    pub fn new(status: &str, status_msg: &str, progress: u32) -> Self {
        Self {
            status: status.to_string(),
            status_msg: status_msg.to_string(),
            progress,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("serialising progress")
    }
}

/// One pending step advertised on the device's trail.
#[derive(Debug, Clone)]
pub struct Step {
    pub rev: String,
    pub state: Value,
    pub commitmsg: Option<String>,
}

/// Claim status of this device on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Unclaimed { challenge: String },
}

#[derive(Debug)]
pub struct Hub {
    base: Url,
    client: blocking::Client,
    token: Option<String>,
    retries: u32,
}

impl Hub {
    pub fn new(config: &Config) -> Result<Self> {
        let base = base_url(&config.creds.host, config.creds.port)?;
        let client = new_http_client(Path::new(CERTS_DIR))?;
        Ok(Self {
            base,
            client,
            token: None,
            retries: config.updater.revision_retries,
        })
    }

    /// Cheap reachability probe: can we open a TCP connection to the
    /// configured host at all.
    pub fn is_available(&self, config: &Config) -> bool {
        let addr = format!("{}:{}", config.creds.host, config.creds.port);
        let mut addrs = match addr.to_socket_addrs() {
            Ok(a) => a,
            Err(e) => {
                debug!("resolving {} failed: {}", addr, e);
                return false;
            }
        };
        match addrs
            .next()
            .map(|a| TcpStream::connect_timeout(&a, Duration::from_secs(5)))
        {
            Some(Ok(_)) => true,
            _ => false,
        }
    }

    /// Drop the cached auth token; the next request logs in again.
    pub fn release(&mut self) {
        self.token = None;
    }

    pub fn is_authed(&self) -> bool {
        self.token.is_some()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("building endpoint '{}'", path))
    }

    fn ensure_auth(&mut self, config: &Config) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }
        let url = self.endpoint("/auth/login")?;
        let body = serde_json::json!({
            "username": config.creds.prn,
            "password": config.creds.secret,
        });
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .context("sending login request")?
            .error_for_status()
            .context("logging in")?;
        let value: Value = resp.json().context("parsing login response")?;
        let token = value
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("login response has no token"))?;
        self.token = Some(token.to_string());
        debug!("authenticated against {}", self.base);
        Ok(())
    }

    /// Send a request with bounded exponential-backoff retries for
    /// transient errors. An auth rejection clears the cached token so the
    /// next call logs in afresh.
    fn execute(&mut self, req: blocking::RequestBuilder) -> Result<blocking::Response> {
        let mut delay = 1;
        let mut tries = self.retries.max(1);
        loop {
            let attempt = req
                .try_clone()
                .context("cloning request for retry")?;
            let attempt = match &self.token {
                Some(token) => attempt.bearer_auth(token),
                None => attempt,
            };
            let err: anyhow::Error = match attempt.send() {
                Err(err) => err.into(),
                Ok(resp) => match resp.status() {
                    StatusCode::UNAUTHORIZED => {
                        self.token = None;
                        bail!("authentication rejected");
                    }
                    s if RETRY_STATUS_CODES.contains(&s.as_u16()) => {
                        anyhow!("HTTP {} {}", s.as_u16(), s.canonical_reason().unwrap_or(""))
                    }
                    _ => return resp.error_for_status().context("hub request failed"),
                },
            };

            tries -= 1;
            if tries == 0 {
                return Err(err);
            }
            debug!("hub request failed ({:#}), retrying in {}s", err, delay);
            sleep(Duration::from_secs(delay));
            delay = (delay * 2).min(10);
        }
    }

    /// GET the device document.
    pub fn get_device(&mut self, config: &Config) -> Result<String> {
        self.ensure_auth(config)?;
        let url = self.endpoint(&format!("/devices/{}", config.creds.id))?;
        let resp = self.execute(self.client.get(url))?;
        resp.text().context("reading device document")
    }

    pub fn device_exists(&mut self, config: &Config) -> bool {
        if config.creds.id.is_empty() {
            return false;
        }
        match self.get_device(config) {
            Ok(body) => serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(|s| !s.is_empty()))
                .unwrap_or(false),
            Err(e) => {
                debug!("device lookup failed: {:#}", e);
                false
            }
        }
    }

    /// Self-register with a fresh random secret; the returned identity is
    /// written back into the config.
    pub fn register_self(&mut self, config: &mut Config) -> Result<()> {
        let url = self.endpoint("/devices/")?;
        let secret = rand_secret();
        let body = serde_json::json!({ "secret": secret });
        // registration happens before we have credentials to log in with
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .context("sending registration request")?
            .error_for_status()
            .context("registering device")?;
        let value: Value = resp.json().context("parsing registration response")?;
        let field = |key: &str| -> Result<String> {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("registration response has no {}", key))
        };
        config.creds.id = field("id")?;
        config.creds.prn = field("prn")?;
        config.creds.secret = field("secret")?;
        info!("registered as device {}", config.creds.id);
        Ok(())
    }

    /// Check whether somebody claimed this device yet.
    pub fn device_owned(&mut self, config: &Config) -> Result<Ownership> {
        let body = self.get_device(config)?;
        let value: Value = serde_json::from_str(&body).context("parsing device document")?;
        match value.get("owner").and_then(Value::as_str) {
            Some(owner) if !owner.is_empty() => {
                debug!("device owner: '{}'", owner);
                Ok(Ownership::Owned)
            }
            _ => {
                let challenge = value
                    .get("challenge")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(Ownership::Unclaimed { challenge })
            }
        }
    }

    /// Steps the hub advertises on our trail, oldest first.
    pub fn pending_steps(&mut self, config: &Config) -> Result<Vec<Step>> {
        self.ensure_auth(config)?;
        let url = self.endpoint(&format!("/trails/{}/steps", config.creds.prn))?;
        let resp = self.execute(self.client.get(url))?;
        let body = resp.text().context("reading steps")?;
        parse_steps(&body)
    }

    pub fn put_progress(
        &mut self,
        config: &Config,
        rev: &str,
        progress: &StepProgress,
    ) -> Result<()> {
        self.ensure_auth(config)?;
        let url = self.endpoint(&format!(
            "/trails/{}/steps/{}/progress",
            config.creds.prn, rev
        ))?;
        self.execute(self.client.put(url).json(progress))?;
        debug!("reported {} progress {}", rev, progress.status);
        Ok(())
    }

    /// Stream one object; the response body is the blob.
    pub fn download_object(
        &mut self,
        config: &Config,
        id: &str,
    ) -> Result<blocking::Response> {
        self.ensure_auth(config)?;
        let url = self.endpoint(&format!("/objects/{}", id))?;
        self.execute(self.client.get(url))
    }

    pub fn upload_devmeta(&mut self, config: &Config, json: &str) -> Result<()> {
        self.ensure_auth(config)?;
        let url = self.endpoint(&format!("/devices/{}/device-meta", config.creds.id))?;
        self.execute(
            self.client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(json.to_string()),
        )?;
        Ok(())
    }
}

fn base_url(host: &str, port: u16) -> Result<Url> {
    let host = if host.is_empty() {
        "api.pantahub.com"
    } else {
        host
    };
    Url::parse(&format!("https://{}:{}", host, port))
        .with_context(|| format!("building base URL for {}:{}", host, port))
}

/// Build the blocking client, trusting the certificates shipped under
/// `/certs`.
fn new_http_client(certs_dir: &Path) -> Result<blocking::Client> {
    let mut builder = blocking::ClientBuilder::new()
        .timeout(HTTP_COMPLETION_TIMEOUT)
        .user_agent(format!("pantavisor/{}", env!("CARGO_PKG_VERSION")));
    if let Ok(entries) = read_dir(certs_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let pem = match std::fs::read(&path) {
                Ok(p) => p,
                Err(_) => continue,
            };
            match reqwest::Certificate::from_pem(&pem) {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(e) => warn!("skipping certificate {}: {}", path.display(), e),
            }
        }
    }
    builder.build().context("building HTTP client")
}

/// The steps endpoint returns an array of step documents; `rev` may be a
/// number or a string depending on hub version.
fn parse_steps(body: &str) -> Result<Vec<Step>> {
    let value: Value = serde_json::from_str(body).context("parsing steps")?;
    let array = value
        .as_array()
        .ok_or_else(|| anyhow!("steps response is not an array"))?;
    let mut steps = Vec::new();
    for entry in array {
        let rev = match entry.get("rev") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                warn!("skipping step without rev");
                continue;
            }
        };
        let state = match entry.get("state") {
            Some(state) if state.is_object() => state.clone(),
            _ => {
                warn!("skipping step {} without state", rev);
                continue;
            }
        };
        let commitmsg = entry
            .get("commit-msg")
            .and_then(Value::as_str)
            .map(str::to_string);
        steps.push(Step {
            rev,
            state,
            commitmsg,
        });
    }
    Ok(steps)
}

/// Ten random characters, enough entropy for a registration secret.
fn rand_secret() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[..10].to_string()
}

/// Refresh the unclaimed-flow hint files: the device id and the claim
/// challenge operators need to adopt the device.
pub fn update_claim_hints(pv_dir: &Path, config: &Config, challenge: Option<&str>) {
    let _ = std::fs::write(
        pv_dir.join("device-id"),
        format!("{}\n", config.creds.id),
    );
    if let Some(challenge) = challenge {
        let _ = std::fs::write(pv_dir.join("challenge"), format!("{}\n", challenge));
    } else {
        let _ = std::fs::write(pv_dir.join("challenge"), "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let url = base_url("hub.example.com", 1234).unwrap();
        assert_eq!(url.as_str(), "https://hub.example.com:1234/");
        // empty host falls back to the global instance
        let url = base_url("", 443).unwrap();
        assert_eq!(url.host_str(), Some("api.pantahub.com"));
    }

    #[test]
    fn test_progress_serialisation() {
        let progress = StepProgress::new("DONE", "update finished", 100);
        let value: Value = serde_json::from_str(&progress.to_json()).unwrap();
        assert_eq!(value["status"], "DONE");
        assert_eq!(value["status-msg"], "update finished");
        assert_eq!(value["progress"], 100);
    }

    #[test]
    fn test_parse_steps() {
        let body = r##"[
            {"rev": 11, "state": {"#spec": "x"}, "commit-msg": "new kernel"},
            {"rev": "12", "state": {"#spec": "x"}},
            {"rev": 13},
            {"state": {}}
        ]"##;
        let steps = parse_steps(body).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].rev, "11");
        assert_eq!(steps[0].commitmsg.as_deref(), Some("new kernel"));
        assert_eq!(steps[1].rev, "12");
        assert_eq!(steps[1].commitmsg, None);

        parse_steps("{}").unwrap_err();
    }

    #[test]
    fn test_rand_secret_shape() {
        let a = rand_secret();
        let b = rand_secret();
        assert_eq!(a.len(), 10);
        assert_ne!(a, b);
    }

    #[test]
    fn test_update_claim_hints() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.creds.id = "dev42".to_string();

        update_claim_hints(dir.path(), &config, Some("tasty-cloud-1234"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("device-id")).unwrap(),
            "dev42\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("challenge")).unwrap(),
            "tasty-cloud-1234\n"
        );

        // claiming clears the challenge
        update_claim_hints(dir.path(), &config, None);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("challenge")).unwrap(),
            ""
        );
    }
}
