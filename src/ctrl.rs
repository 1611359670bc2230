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

//! Out-of-band command channel: a local Unix socket carrying one JSON
//! message per connection, drained once per wait tick with a bounded
//! poll.

use anyhow::{anyhow, bail, Context, Result};
use nix::poll::{poll, PollFd, PollFlags};
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default socket location consumed by on-device tooling.
pub const CTRL_SOCKET_PATH: &str = "/pv/pv-ctrl";

/// Commands rejected mid-update or on claimed devices are enforced by
/// the controller, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlCmd {
    UpdateMetadata(String),
    Reboot(String),
    Poweroff(String),
    LocalRun(String),
    MakeFactory(String),
    RunGc,
    ListRevisions,
}

#[derive(Debug)]
pub struct CtrlRequest {
    pub cmd: CtrlCmd,
    stream: UnixStream,
}

impl CtrlRequest {
    pub fn respond_ok(self) {
        self.respond(r#"{"result":"OK"}"#);
    }

    pub fn respond_err(self, message: &str) {
        let body = serde_json::json!({"result": "ERROR", "message": message});
        self.respond(&body.to_string());
    }

    pub fn respond(mut self, body: &str) {
        if let Err(e) = self.stream.write_all(body.as_bytes()) {
            debug!("control response dropped: {}", e);
        }
    }
}

#[derive(Debug)]
pub struct CtrlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl CtrlSocket {
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding control socket {}", path.display()))?;
        listener
            .set_nonblocking(true)
            .context("setting control socket non-blocking")?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Wait up to `timeout` for one command. Malformed messages are
    /// answered with an error and swallowed.
    pub fn wait(&self, timeout: Duration) -> Option<CtrlRequest> {
        let mut fds = [PollFd::new(self.listener.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout.as_millis() as libc::c_int) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                warn!("polling control socket: {}", e);
                return None;
            }
        }
        let (mut stream, _addr) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                warn!("accepting control connection: {}", e);
                return None;
            }
        };
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let _ = stream.set_nonblocking(false);

        let message = match read_bounded(&mut stream) {
            Ok(m) => m,
            Err(e) => {
                warn!("reading control message: {:#}", e);
                return None;
            }
        };
        match parse_command(&message) {
            Ok(cmd) => {
                debug!("control command received: {:?}", cmd);
                Some(CtrlRequest { cmd, stream })
            }
            Err(e) => {
                warn!("bad control message: {:#}", e);
                let body =
                    serde_json::json!({"result": "ERROR", "message": format!("{:#}", e)});
                let _ = stream.write_all(body.to_string().as_bytes());
                None
            }
        }
    }
}

impl Drop for CtrlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read one message, bounded to keep a hostile client from ballooning
/// memory.
fn read_bounded(stream: &mut UnixStream) -> Result<String> {
    const MAX_MESSAGE: u64 = 1024 * 1024;
    let mut buf = String::new();
    stream
        .take(MAX_MESSAGE)
        .read_to_string(&mut buf)
        .context("reading message")?;
    if buf.is_empty() {
        bail!("empty message");
    }
    Ok(buf)
}

fn parse_command(message: &str) -> Result<CtrlCmd> {
    let value: Value = serde_json::from_str(message).context("parsing command json")?;
    let op = value
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("command has no op"))?;
    let payload = || {
        value
            .get("payload")
            .map(|p| match p.as_str() {
                Some(s) => s.to_string(),
                None => p.to_string(),
            })
            .unwrap_or_default()
    };
    match op {
        "UPDATE_METADATA" => Ok(CtrlCmd::UpdateMetadata(payload())),
        "REBOOT" => Ok(CtrlCmd::Reboot(payload())),
        "POWEROFF" => Ok(CtrlCmd::Poweroff(payload())),
        "LOCAL_RUN" => Ok(CtrlCmd::LocalRun(payload())),
        "MAKE_FACTORY" => Ok(CtrlCmd::MakeFactory(payload())),
        "RUN_GC" => Ok(CtrlCmd::RunGc),
        "LIST_REVISIONS" => Ok(CtrlCmd::ListRevisions),
        _ => bail!("unknown op '{}'", op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::net::UnixStream as ClientStream;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_parse_command() {
        struct Test {
            message: &'static str,
            expect: Option<CtrlCmd>,
        }
        let tests = vec![
            Test {
                message: r#"{"op": "REBOOT", "payload": "maintenance"}"#,
                expect: Some(CtrlCmd::Reboot("maintenance".to_string())),
            },
            Test {
                message: r#"{"op": "RUN_GC"}"#,
                expect: Some(CtrlCmd::RunGc),
            },
            Test {
                message: r#"{"op": "LIST_REVISIONS"}"#,
                expect: Some(CtrlCmd::ListRevisions),
            },
            Test {
                message: r#"{"op": "UPDATE_METADATA", "payload": {"k": "v"}}"#,
                expect: Some(CtrlCmd::UpdateMetadata(r#"{"k":"v"}"#.to_string())),
            },
            Test {
                message: r#"{"op": "MAKE_FACTORY", "payload": ""}"#,
                expect: Some(CtrlCmd::MakeFactory(String::new())),
            },
            Test {
                message: r#"{"op": "SELF_DESTRUCT"}"#,
                expect: None,
            },
            Test {
                message: "not json",
                expect: None,
            },
            Test {
                message: r#"{"payload": "x"}"#,
                expect: None,
            },
        ];
        for (i, test) in tests.iter().enumerate() {
            match parse_command(test.message) {
                Ok(cmd) => assert_eq!(Some(cmd), test.expect, "case {}", i),
                Err(_) => assert!(test.expect.is_none(), "case {}", i),
            }
        }
    }

    #[test]
    fn test_socket_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pv-ctrl");
        let socket = CtrlSocket::bind(&path).unwrap();

        let client_path = path.clone();
        let client = thread::spawn(move || {
            let mut stream = ClientStream::connect(&client_path).unwrap();
            stream
                .write_all(br#"{"op": "REBOOT", "payload": "now"}"#)
                .unwrap();
            stream.shutdown(std::net::Shutdown::Write).unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            response
        });

        let request = socket.wait(Duration::from_secs(5)).expect("command");
        assert_eq!(request.cmd, CtrlCmd::Reboot("now".to_string()));
        request.respond_ok();

        let response = client.join().unwrap();
        assert!(response.contains("OK"));
    }

    #[test]
    fn test_wait_times_out() {
        let dir = TempDir::new().unwrap();
        let socket = CtrlSocket::bind(&dir.path().join("pv-ctrl")).unwrap();
        let started = std::time::Instant::now();
        assert!(socket.wait(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stale_socket_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pv-ctrl");
        let first = CtrlSocket::bind(&path).unwrap();
        drop(first);
        // rebinding over leftovers works
        std::fs::write(&path, "").ok();
        CtrlSocket::bind(&path).unwrap();
    }
}
