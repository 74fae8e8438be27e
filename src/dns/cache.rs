//! TTL-indexed record cache for reducing upstream queries.
//!
//! Records are keyed by (lowercased name, type) and deduplicated by rdata.
//! Expiry is tracked as an absolute wall-clock instant so a snapshot written
//! at shutdown keeps counting down while the process is stopped.

use crate::dns::wire::{Name, RecordType};
use crate::error::DnsError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    rtype: RecordType,
}

impl CacheKey {
    fn new(name: &Name, rtype: RecordType) -> Self {
        CacheKey {
            name: name.to_lowercase(),
            rtype,
        }
    }
}

/// A cached record entry
#[derive(Debug, Clone)]
struct CacheEntry {
    rdata: Vec<u8>,
    ttl: u32,
    expires_at: SystemTime,
}

impl CacheEntry {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

/// A record served from the cache with its remaining TTL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
    pub rdata: Vec<u8>,
    pub ttl: u32,
}

/// Concurrent record cache.
///
/// The map sits behind one store-wide lock that is only held for the map
/// operation itself, never across file or network I/O.
pub struct RecordCache {
    entries: Mutex<HashMap<CacheKey, Vec<CacheEntry>>>,
    max_ttl: u32,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCache {
    pub fn new() -> Self {
        Self::with_max_ttl(u32::MAX)
    }

    /// Create a cache that caps stored TTLs at `max_ttl` seconds
    pub fn with_max_ttl(max_ttl: u32) -> Self {
        RecordCache {
            entries: Mutex::new(HashMap::new()),
            max_ttl,
        }
    }

    /// Store a record. Re-adding identical rdata refreshes its TTL in place.
    pub async fn add(&self, name: &Name, rtype: RecordType, rdata: &[u8], ttl: u32) {
        self.add_at(name, rtype, rdata, ttl, SystemTime::now()).await
    }

    async fn add_at(
        &self,
        name: &Name,
        rtype: RecordType,
        rdata: &[u8],
        ttl: u32,
        now: SystemTime,
    ) {
        let ttl = ttl.min(self.max_ttl);
        let expires_at = truncate_to_millis(now + Duration::from_secs(u64::from(ttl)));
        let key = CacheKey::new(name, rtype);

        let mut entries = self.entries.lock().await;
        let list = entries.entry(key).or_default();
        if let Some(existing) = list.iter_mut().find(|e| e.rdata == rdata) {
            existing.ttl = ttl;
            existing.expires_at = expires_at;
        } else {
            list.push(CacheEntry {
                rdata: rdata.to_vec(),
                ttl,
                expires_at,
            });
        }
    }

    /// Live records for (name, type), or `None` on a miss.
    ///
    /// Expired entries found on the way are removed. A returned list is never
    /// empty.
    pub async fn lookup(&self, name: &Name, rtype: RecordType) -> Option<Vec<CachedRecord>> {
        self.lookup_at(name, rtype, SystemTime::now()).await
    }

    async fn lookup_at(
        &self,
        name: &Name,
        rtype: RecordType,
        now: SystemTime,
    ) -> Option<Vec<CachedRecord>> {
        let key = CacheKey::new(name, rtype);
        let mut entries = self.entries.lock().await;

        let list = entries.get_mut(&key)?;
        list.retain(|e| e.is_live(now));
        if list.is_empty() {
            entries.remove(&key);
            return None;
        }

        Some(
            list.iter()
                .map(|e| CachedRecord {
                    rdata: e.rdata.clone(),
                    ttl: remaining_ttl(e.expires_at, now),
                })
                .collect(),
        )
    }

    /// Remove expired entries, dropping keys left empty.
    /// Returns the number of records removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(SystemTime::now()).await
    }

    async fn sweep_at(&self, now: SystemTime) -> usize {
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.is_live(now));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Number of stored records, including ones not yet swept
    pub async fn len(&self) -> usize {
        self.entries.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Write all live records to `path`. The snapshot is written to a sibling
    /// temporary file first and renamed into place.
    pub async fn persist(&self, path: &Path) -> Result<usize, DnsError> {
        self.persist_at(path, SystemTime::now()).await
    }

    async fn persist_at(&self, path: &Path, now: SystemTime) -> Result<usize, DnsError> {
        let records: Vec<SnapshotRecord> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .flat_map(|(key, list)| {
                    list.iter()
                        .filter(|e| e.is_live(now))
                        .map(move |e| SnapshotRecord {
                            name: key.name.clone(),
                            rtype: key.rtype.to_u16(),
                            rdata: e.rdata.clone(),
                            ttl: e.ttl,
                            expires_at_ms: unix_millis(e.expires_at),
                        })
                })
                .collect()
        };

        let count = records.len();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            records,
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| DnsError::CachePersistFailed(e.to_string()))?;

        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| DnsError::CachePersistFailed(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| DnsError::CachePersistFailed(format!("{}: {}", path.display(), e)))?;

        Ok(count)
    }

    /// Replace the cache contents with the snapshot at `path`.
    ///
    /// Returns `Ok(None)` when no snapshot exists. Records already expired
    /// are discarded. On error the cache is left untouched.
    pub async fn restore(&self, path: &Path) -> Result<Option<usize>, DnsError> {
        self.restore_at(path, SystemTime::now()).await
    }

    async fn restore_at(&self, path: &Path, now: SystemTime) -> Result<Option<usize>, DnsError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DnsError::CacheRestoreFailed(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| DnsError::CacheRestoreFailed(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DnsError::CacheRestoreFailed(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut restored: HashMap<CacheKey, Vec<CacheEntry>> = HashMap::new();
        let mut count = 0;
        for record in snapshot.records {
            let expires_at = UNIX_EPOCH + Duration::from_millis(record.expires_at_ms);
            if expires_at <= now {
                continue;
            }
            let key = CacheKey {
                name: record.name.to_ascii_lowercase(),
                rtype: RecordType::from_u16(record.rtype),
            };
            let list = restored.entry(key).or_default();
            if list.iter().any(|e| e.rdata == record.rdata) {
                continue;
            }
            list.push(CacheEntry {
                rdata: record.rdata,
                ttl: record.ttl,
                expires_at,
            });
            count += 1;
        }

        *self.entries.lock().await = restored;
        Ok(Some(count))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    rdata: Vec<u8>,
    ttl: u32,
    expires_at_ms: u64,
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// Snapshots store milliseconds; keep in-memory expiry at the same precision
fn truncate_to_millis(t: SystemTime) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(unix_millis(t))
}

/// Seconds left until `expires_at`, rounded to the nearest second
fn remaining_ttl(expires_at: SystemTime, now: SystemTime) -> u32 {
    let left = expires_at.duration_since(now).unwrap_or(Duration::ZERO);
    let secs = (left.as_millis() + 500) / 1000;
    u32::try_from(secs).unwrap_or(u32::MAX)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
