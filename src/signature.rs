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

//! Secure-boot gate over state JSON. The envelope is a top-level
//! `#signature` object carrying a digest of the remaining document;
//! asymmetric schemes plug in behind the same `verify` entry point.

use serde_json::Value;
use tracing::{error, warn};

use crate::config::SecurebootMode;
use crate::objects::sha256_hex;

const SIGNATURE_KEY: &str = "#signature";

/// Gate a state document according to the configured mode. `disabled`
/// accepts everything; `lenient` tolerates a missing envelope but not a
/// broken one; `strict` requires a valid envelope.
pub fn verify(json: &str, mode: SecurebootMode) -> bool {
    if mode == SecurebootMode::Disabled {
        return true;
    }
    let root: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            error!("state json does not parse: {}", e);
            return false;
        }
    };
    let envelope = match root.get(SIGNATURE_KEY) {
        Some(envelope) => envelope,
        None => {
            return match mode {
                SecurebootMode::Lenient => {
                    warn!("state carries no signature, accepting in lenient mode");
                    true
                }
                _ => {
                    error!("state carries no signature");
                    false
                }
            };
        }
    };
    match check_envelope(&root, envelope) {
        Ok(()) => true,
        Err(reason) => {
            error!("state signature verification failed: {}", reason);
            false
        }
    }
}

fn check_envelope(root: &Value, envelope: &Value) -> Result<(), String> {
    let alg = envelope
        .get("alg")
        .and_then(Value::as_str)
        .ok_or_else(|| "envelope has no alg".to_string())?;
    if alg != "sha256" {
        return Err(format!("unsupported algorithm '{}'", alg));
    }
    let digest = envelope
        .get("digest")
        .and_then(Value::as_str)
        .ok_or_else(|| "envelope has no digest".to_string())?;

    let computed = sha256_hex(payload_bytes(root).as_bytes());
    if computed != digest {
        return Err(format!("digest mismatch, computed {}", computed));
    }
    Ok(())
}

/// Canonical payload: the document without its envelope, serialised with
/// sorted keys (serde_json maps preserve insertion order, so re-collect
/// into a sorted map first).
fn payload_bytes(root: &Value) -> String {
    let mut sorted = std::collections::BTreeMap::new();
    if let Some(map) = root.as_object() {
        for (key, value) in map {
            if key != SIGNATURE_KEY {
                sorted.insert(key.clone(), value.clone());
            }
        }
    }
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// Attach an envelope to a state document. Test and tooling helper; the
/// device only ever verifies.
pub fn sign(json: &str) -> Option<String> {
    let root: Value = serde_json::from_str(json).ok()?;
    let digest = sha256_hex(payload_bytes(&root).as_bytes());
    let mut map = root.as_object()?.clone();
    map.insert(
        SIGNATURE_KEY.to_string(),
        serde_json::json!({ "alg": "sha256", "digest": digest }),
    );
    Some(Value::Object(map).to_string())
}
