//! Lock files in a shared directory
//!
//! `{dir}/{key}.lock` holds the lease as JSON and is created with
//! `create_new`, so exactly one creator wins. Ending a generation, either by
//! taking over an expired lease or by releasing a live one, first requires
//! creating `{key}.lock.takeover-{expiry_ms}-{owner}` for that generation;
//! only one party can create that marker.
//!
//! File IO is blocking, so every operation runs on the blocking pool.

use super::{expiry_after, LockError, LockLease, LockManager, LockResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File-based lock backend
#[derive(Debug, Clone)]
pub struct FileLockManager {
    dir: PathBuf,
}

/// What a lock file currently says
enum Observed {
    Missing,
    Lease(LockLease),
    /// Created but not yet (or never) written; judged by modification time
    Unreadable { modified: DateTime<Utc> },
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> LockResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(key)))
    }

    fn marker_prefix(&self, key: &str) -> String {
        format!("{}.lock.takeover-", file_stem(key))
    }

    fn read(&self, path: &Path) -> LockResult<Observed> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Observed::Missing),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<LockLease>(&content) {
            Ok(lease) => Ok(Observed::Lease(lease)),
            Err(_) => {
                let modified = fs::metadata(path)?.modified()?;
                Ok(Observed::Unreadable {
                    modified: DateTime::<Utc>::from(modified),
                })
            }
        }
    }

    fn try_create(&self, path: &Path, lease: &LockLease) -> LockResult<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec(lease)?)?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the marker that ends `generation`; false if someone else did
    fn claim_generation(&self, key: &str, generation: &str) -> LockResult<bool> {
        let marker = self
            .dir
            .join(format!("{}{}", self.marker_prefix(key), generation));
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the generation named `generation`
    fn try_takeover(&self, path: &Path, generation: &str, lease: &LockLease) -> LockResult<bool> {
        if !self.claim_generation(&lease.key, generation)? {
            return Ok(false);
        }

        let tmp = path.with_extension(format!("lock.{}.tmp", lease.owner_id));
        fs::write(&tmp, serde_json::to_vec(lease)?)?;
        fs::rename(&tmp, path)?;
        Ok(true)
    }

    /// End `lease`'s generation and remove the lock file. False when a
    /// takeover claimed the generation first; the file is left alone then.
    fn retire(&self, path: &Path, lease: &LockLease) -> LockResult<bool> {
        let generation = generation_of(lease);
        if !self.claim_generation(&lease.key, &generation)? {
            return Ok(false);
        }

        match self.read(path)? {
            Observed::Lease(current) if current.same_lease(lease) => {}
            _ => return Ok(false),
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.remove_markers_before(&lease.key, lease.expires_at.timestamp_millis());
        Ok(true)
    }

    /// Drop markers of generations that expired before `expiry_ms`. The
    /// newest marker stays so a stalled contender cannot reclaim it.
    fn remove_markers_before(&self, key: &str, expiry_ms: i64) {
        let prefix = self.marker_prefix(key);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let older = name
                .to_string_lossy()
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.split('-').next()?.parse::<i64>().ok())
                .is_some_and(|marked| marked < expiry_ms);
            if older {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    fn acquire_blocking(&self, key: &str, ttl: Duration) -> LockResult<LockLease> {
        let path = self.lock_path(key);
        let lease = LockLease::new(key, ttl)?;

        // A racing release can delete the file between our create and read
        for _ in 0..3 {
            if self.try_create(&path, &lease)? {
                tracing::debug!(key, owner = %lease.owner_id, path = ?path, "Acquired lock");
                return Ok(lease);
            }

            let (expired, generation, current) = match self.read(&path)? {
                Observed::Missing => continue,
                Observed::Lease(current) => {
                    (current.is_expired(), generation_of(&current), Some(current))
                }
                Observed::Unreadable { modified } => {
                    let ttl_elapsed = expiry_after(modified, ttl)
                        .map(|expiry| Utc::now() >= expiry)
                        .unwrap_or(false);
                    (ttl_elapsed, modified.timestamp_millis().to_string(), None)
                }
            };

            if !expired {
                return Err(match current {
                    Some(current) => current.held_error(),
                    None => LockError::Held {
                        key: key.to_string(),
                        owner: "unknown".to_string(),
                        expires_at: Utc::now(),
                    },
                });
            }

            if self.try_takeover(&path, &generation, &lease)? {
                tracing::info!(
                    key,
                    owner = %lease.owner_id,
                    previous_owner = ?current.as_ref().map(|c| c.owner_id.as_str()),
                    "Took over expired lock"
                );
                return Ok(lease);
            }
        }

        match self.read(&path)? {
            Observed::Lease(current) => Err(current.held_error()),
            _ => Err(LockError::Held {
                key: key.to_string(),
                owner: "unknown".to_string(),
                expires_at: Utc::now(),
            }),
        }
    }

    fn release_blocking(&self, lease: &LockLease) -> LockResult<()> {
        let path = self.lock_path(&lease.key);
        let released = match self.read(&path)? {
            Observed::Lease(current) if current.same_lease(lease) && !current.is_expired() => {
                self.retire(&path, lease)?
            }
            _ => false,
        };

        if released {
            tracing::debug!(key = %lease.key, owner = %lease.owner_id, "Released lock");
        } else {
            tracing::debug!(key = %lease.key, owner = %lease.owner_id, "Lease no longer held, nothing to release");
        }
        Ok(())
    }

    fn is_held_blocking(&self, key: &str) -> LockResult<bool> {
        Ok(match self.read(&self.lock_path(key))? {
            Observed::Lease(current) => !current.is_expired(),
            Observed::Missing => false,
            Observed::Unreadable { .. } => true,
        })
    }
}

/// Marker suffix naming one lease generation
fn generation_of(lease: &LockLease) -> String {
    format!("{}-{}", lease.expires_at.timestamp_millis(), lease.owner_id)
}

/// Key as a portable file name
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl LockManager for FileLockManager {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn acquire(&self, key: &str, ttl: Duration) -> LockResult<LockLease> {
        let manager = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || manager.acquire_blocking(&key, ttl)).await?
    }

    async fn release(&self, lease: &LockLease) -> LockResult<()> {
        let manager = self.clone();
        let lease = lease.clone();
        tokio::task::spawn_blocking(move || manager.release_blocking(&lease)).await?
    }

    async fn is_held(&self, key: &str) -> LockResult<bool> {
        let manager = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || manager.is_held_blocking(&key)).await?
    }
}
