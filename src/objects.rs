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

//! Content-addressed blob store under `<mnt>/objects/<sha256>`, with
//! hard links into per-revision trees.

use lazy_static::lazy_static;
use openssl::sha::Sha256;
use regex::Regex;
use std::fs::{create_dir_all, hard_link, read_dir, remove_file, rename, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Amortize syscall overhead while streaming blobs.
pub const BUFFER_SIZE: usize = 256 * 1024;

lazy_static! {
    static ref OBJECT_ID: Regex = Regex::new(r"^[0-9a-f]{64}$").expect("compiling RE");
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("checksum mismatch for object {id}: computed {computed}")]
    ChecksumMismatch { id: String, computed: String },
    #[error("invalid object id '{0}'")]
    InvalidId(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
    use_tmp: bool,
}

impl ObjectStore {
    pub fn new(mnt: &Path, use_tmp: bool) -> Self {
        Self {
            dir: mnt.join("objects"),
            use_tmp,
        }
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        create_dir_all(&self.dir)
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Stream a blob into the store, hashing as we go. The data lands in
    /// `<id>.new` and is only renamed into place once the digest checks
    /// out, so a crash can never leave a corrupt blob under its final
    /// name. Returns the byte count written.
    pub fn put(&self, id: &str, reader: &mut dyn Read) -> Result<u64, ObjectError> {
        if !OBJECT_ID.is_match(id) {
            return Err(ObjectError::InvalidId(id.to_string()));
        }
        let final_path = self.path_for(id);
        let tmp_path = if self.use_tmp {
            self.dir.join(format!("{}.new", id))
        } else {
            final_path.clone()
        };

        let result = self.write_and_hash(id, &tmp_path, reader);
        match result {
            Ok(written) => {
                if self.use_tmp {
                    rename(&tmp_path, &final_path)?;
                }
                // make the rename durable before anything references it
                File::open(&self.dir).and_then(|d| d.sync_all())?;
                Ok(written)
            }
            Err(e) => {
                let _ = remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_and_hash(
        &self,
        id: &str,
        path: &Path,
        reader: &mut dyn Read,
    ) -> Result<u64, ObjectError> {
        let mut dest = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut written: u64 = 0;
        loop {
            let count = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..count]);
            dest.write_all(&buf[..count])?;
            written += count as u64;
        }
        dest.sync_all()?;
        drop(dest);

        let computed = hasher.finish();
        let expected = match hex::decode(id) {
            Ok(e) => e,
            Err(_) => return Err(ObjectError::InvalidId(id.to_string())),
        };
        if computed[..] != expected[..] {
            return Err(ObjectError::ChecksumMismatch {
                id: id.to_string(),
                computed: hex::encode(computed),
            });
        }
        Ok(written)
    }

    /// Re-hash an object on disk and compare against its name.
    pub fn verify(&self, id: &str) -> Result<(), ObjectError> {
        if !OBJECT_ID.is_match(id) {
            return Err(ObjectError::InvalidId(id.to_string()));
        }
        let mut file = File::open(self.path_for(id))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let count = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..count]);
        }
        let computed = hasher.finish();
        let expected = hex::decode(id).map_err(|_| ObjectError::InvalidId(id.to_string()))?;
        if computed[..] != expected[..] {
            return Err(ObjectError::ChecksumMismatch {
                id: id.to_string(),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }

    /// Whether the blob is already present and passes verification.
    pub fn contains_valid(&self, id: &str) -> bool {
        self.path_for(id).exists() && self.verify(id).is_ok()
    }

    /// Hard-link `objects/<id>` to an arbitrary destination path, creating
    /// parent directories. An existing destination is replaced.
    pub fn link_into(&self, dest: &Path, id: &str) -> Result<(), ObjectError> {
        if !OBJECT_ID.is_match(id) {
            return Err(ObjectError::InvalidId(id.to_string()));
        }
        if let Some(parent) = dest.parent() {
            create_dir_all(parent)?;
        }
        if dest.exists() {
            remove_file(dest)?;
        }
        hard_link(self.path_for(id), dest)?;
        Ok(())
    }

    /// Enumerate object ids present in the store. In-flight `.new` files
    /// and anything not shaped like a digest are skipped.
    pub fn list_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if OBJECT_ID.is_match(name) {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Hex SHA-256 of a byte buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}
