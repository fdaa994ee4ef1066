//! One directory-backed store per artifact kind
//!
//! All operations on a store run under its mutex, so they are totally
//! ordered. The mutex only ever covers local file I/O.

use super::layout::{self, RecordId, EXT_PEM, EXT_REVOKED, EXT_UPDATE};
use super::record::{CacheKey, RecordMeta, Sidecar};
use super::{InsertOutcome, StoreError};
use chrono::{DateTime, Utc};
use ocspd_proto::{ArtifactKind, CacheAttributes};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenState {
    /// Directory not seen yet (or absent)
    Unopened,
    Ready,
    /// Last open attempt failed; retried on every operation
    Failed,
}

#[derive(Debug)]
struct StoreState {
    open: OpenState,
}

#[derive(Debug)]
pub(crate) struct RecordStore {
    kind: ArtifactKind,
    root: PathBuf,
    state: Mutex<StoreState>,
}

impl RecordStore {
    pub fn new(kind: ArtifactKind, cache_dir: &Path) -> Self {
        Self {
            kind,
            root: cache_dir.join(kind.as_str()),
            state: Mutex::new(StoreState {
                open: OpenState::Unopened,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` when the store directory can be read. A missing directory is
    /// an empty store; anything else is an open failure and reads miss.
    fn open_for_read(&self, state: &mut StoreState) -> bool {
        match fs::metadata(&self.root) {
            Ok(md) if md.is_dir() => {
                state.open = OpenState::Ready;
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                state.open = OpenState::Unopened;
                false
            }
            other => {
                if state.open != OpenState::Failed {
                    let reason = match other {
                        Ok(_) => "not a directory".to_string(),
                        Err(e) => e.to_string(),
                    };
                    warn!(
                        store = %self.kind,
                        path = %self.root.display(),
                        reason = %reason,
                        "Cache store unavailable, serving misses"
                    );
                }
                state.open = OpenState::Failed;
                false
            }
        }
    }

    fn open_for_write(&self, state: &mut StoreState) -> Result<(), StoreError> {
        match fs::create_dir_all(&self.root) {
            Ok(()) if self.root.is_dir() => {
                if state.open != OpenState::Ready {
                    debug!(store = %self.kind, path = %self.root.display(), "Opened cache store");
                }
                state.open = OpenState::Ready;
                Ok(())
            }
            Ok(()) => {
                state.open = OpenState::Failed;
                Err(StoreError::Open {
                    path: self.root.clone(),
                    source: std::io::Error::new(ErrorKind::Other, "not a directory"),
                })
            }
            Err(source) => {
                state.open = OpenState::Failed;
                Err(StoreError::Open {
                    path: self.root.clone(),
                    source,
                })
            }
        }
    }

    fn read_meta(&self, id: RecordId) -> Option<RecordMeta> {
        let path = id.sidecar_file(&self.root);
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Unreadable sidecar");
                return Some(Sidecar::default().into_meta(id));
            }
        };
        let sidecar = serde_json::from_slice::<Sidecar>(&contents).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "Damaged sidecar");
            Sidecar::default()
        });
        Some(sidecar.into_meta(id))
    }

    fn bucket_metas(&self, bucket: &str, out: &mut Vec<RecordMeta>) {
        let dir = self.root.join(bucket);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXT_UPDATE) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = RecordId {
                kind: self.kind,
                bucket: bucket.to_string(),
                stem: stem.to_string(),
            };
            if let Some(meta) = self.read_meta(id) {
                out.push(meta);
            }
        }
    }

    /// Metadata matching `key`; caller holds the lock and has opened the store
    fn collect(&self, key: &CacheKey) -> Vec<RecordMeta> {
        let mut out = Vec::new();
        match (&key.identity, &key.resource_url) {
            (Some(identity), Some(url)) => {
                let id = RecordId::new(self.kind, identity, Some(url));
                out.extend(self.read_meta(id));
            }
            (Some(identity), None) => {
                self.bucket_metas(&layout::sha1_hex(identity), &mut out);
            }
            (None, _) => {
                if let Ok(entries) = fs::read_dir(&self.root) {
                    for entry in entries.flatten() {
                        if let Some(bucket) = entry.file_name().to_str() {
                            self.bucket_metas(bucket, &mut out);
                        }
                    }
                }
            }
        }
        out.retain(|meta| key.matches(meta));
        out
    }

    pub fn lookup(&self, key: &CacheKey, as_of: DateTime<Utc>) -> Option<Vec<u8>> {
        let mut state = self.lock();
        if !self.open_for_read(&mut state) {
            return None;
        }

        let mut candidates: Vec<RecordMeta> = self
            .collect(key)
            .into_iter()
            .filter(|meta| meta.is_well_formed() && meta.is_valid_at(as_of))
            .collect();
        candidates.sort_by(|a, b| b.this_update.cmp(&a.this_update));

        for meta in candidates {
            let path = meta.record_id.payload_file(&self.root);
            match fs::read(&path) {
                Ok(payload) if layout::sha1_hex(&payload) == meta.payload_digest => {
                    return Some(payload)
                }
                Ok(_) => {
                    warn!(record = %meta.record_id, "Payload does not match its sidecar digest")
                }
                Err(e) => debug!(record = %meta.record_id, error = %e, "Payload unreadable"),
            }
        }
        None
    }

    pub fn insert(
        &self,
        attrs: &CacheAttributes,
        payload: &[u8],
        source_url: Option<&str>,
        chain_pem: Option<&[u8]>,
    ) -> Result<InsertOutcome, StoreError> {
        let id = RecordId::new(self.kind, &attrs.identity, source_url);
        let digest = layout::sha1_hex(payload);

        let mut state = self.lock();
        self.open_for_write(&mut state)?;

        let replacing = match self.read_meta(id.clone()) {
            Some(existing) => {
                if existing.payload_digest == digest {
                    return Ok(InsertOutcome::AlreadyPresent);
                }
                let stored_is_newer = existing.is_well_formed()
                    && existing.this_update.map_or(false, |t| t > attrs.this_update);
                if stored_is_newer {
                    return Ok(InsertOutcome::AlreadyPresent);
                }
                true
            }
            None => false,
        };

        let sidecar = Sidecar::from_attributes(attrs, source_url, digest, Utc::now());
        let sidecar_json = serde_json::to_vec_pretty(&sidecar).map_err(StoreError::Serialization)?;

        fs::create_dir_all(id.bucket_dir(&self.root))?;
        write_atomic(&id.payload_file(&self.root), payload)?;
        if self.kind == ArtifactKind::Crl {
            let mut serials = String::new();
            for serial in &attrs.revoked_serials {
                serials.push_str(&hex::encode(serial));
                serials.push('\n');
            }
            write_atomic(&id.file(&self.root, EXT_REVOKED), serials.as_bytes())?;
        }
        if let Some(chain) = chain_pem {
            write_atomic(&id.file(&self.root, EXT_PEM), chain)?;
        }
        // Sidecar last: the record exists once this rename lands
        write_atomic(&id.sidecar_file(&self.root), &sidecar_json)?;

        if replacing {
            debug!(record = %id, "Replaced cached record");
            Ok(InsertOutcome::Replaced)
        } else {
            debug!(record = %id, "Inserted cached record");
            Ok(InsertOutcome::Inserted)
        }
    }

    pub fn delete(&self, key: &CacheKey) -> Result<usize, StoreError> {
        let mut state = self.lock();
        if !self.open_for_read(&mut state) {
            return Ok(0);
        }
        let mut removed = 0;
        for meta in self.collect(key) {
            if self.remove_files(&meta.record_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn delete_record(&self, id: &RecordId) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if !self.open_for_read(&mut state) {
            return Ok(false);
        }
        self.remove_files(id)
    }

    /// Deletes every record matching `predicate`, in one critical section
    pub fn delete_where<P>(&self, predicate: P) -> Result<usize, StoreError>
    where
        P: Fn(&RecordMeta) -> bool,
    {
        let mut state = self.lock();
        if !self.open_for_read(&mut state) {
            return Ok(0);
        }
        let mut removed = 0;
        for meta in self.collect(&CacheKey::new(self.kind)) {
            if predicate(&meta) && self.remove_files(&meta.record_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn scan<P>(&self, predicate: P) -> Vec<RecordMeta>
    where
        P: Fn(&RecordMeta) -> bool,
    {
        let mut state = self.lock();
        if !self.open_for_read(&mut state) {
            return Vec::new();
        }
        let mut metas = self.collect(&CacheKey::new(self.kind));
        metas.retain(|m| predicate(m));
        metas
    }

    pub fn read_payload(&self, id: &RecordId) -> Result<Vec<u8>, StoreError> {
        let mut state = self.lock();
        if !self.open_for_read(&mut state) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if !id.sidecar_file(&self.root).exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::read(id.payload_file(&self.root)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
            _ => StoreError::Io(e),
        })
    }

    pub fn count(&self) -> usize {
        self.scan(|_| true).len()
    }

    /// Removes a record's files, sidecar first. Returns whether it existed.
    fn remove_files(&self, id: &RecordId) -> Result<bool, StoreError> {
        let existed = match fs::remove_file(id.sidecar_file(&self.root)) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::Io(e)),
        };
        for path in [
            id.payload_file(&self.root),
            id.file(&self.root, EXT_REVOKED),
            id.file(&self.root, EXT_PEM),
        ] {
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(layout::tmp_path(&path));
        }
        // Only succeeds once the bucket is empty
        let _ = fs::remove_dir(id.bucket_dir(&self.root));
        if existed {
            debug!(record = %id, "Deleted cached record");
        }
        Ok(existed)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = layout::tmp_path(path);
    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Io(e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Io(e));
    }
    Ok(())
}
