//! Dedup store backends for the watcher: JSON document file, PostgreSQL
//! table, and an in-memory set.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cw_core::{DedupStore, Listing, StoreError};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cw-storage";

/// File-backed store holding every confirmed listing keyed by id.
///
/// Each successful `save` of a new id rewrites the whole document, so writes
/// are O(n) in the number of stored listings. An unreadable or corrupt file
/// at open time yields an empty store. An id becomes visible to `exists`
/// only after the document containing it has been renamed into place.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    seen: Mutex<BTreeMap<String, Listing>>,
    generation: AtomicU64,
    /// Generation of the document currently on disk.
    written: Arc<std::sync::Mutex<u64>>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let seen = match load_document(&path).await {
            Ok(Some(seen)) => {
                debug!(path = %path.display(), entries = seen.len(), "loaded dedup store");
                seen
            }
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "unreadable dedup store, starting empty"
                );
                BTreeMap::new()
            }
        };
        Self {
            path,
            seen: Mutex::new(seen),
            generation: AtomicU64::new(0),
            written: Arc::new(std::sync::Mutex::new(0)),
        }
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.lock().await.is_empty()
    }
}

/// Write the full document next to `path` and rename it into place. Runs on
/// a blocking thread so an abandoned save still finishes or cleans up.
fn write_document(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(io_error(&parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dedup-store".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = std::fs::File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(io_error(&temp_path))
        .and_then(|()| std::fs::rename(&temp_path, path).map_err(io_error(path)));
    if written.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    written
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

async fn load_document(path: &Path) -> anyhow::Result<Option<BTreeMap<String, Listing>>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let seen = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(seen))
}

#[async_trait]
impl DedupStore for JsonFileStore {
    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.seen.lock().await.contains_key(id))
    }

    async fn save(&self, listing: &Listing) -> Result<(), StoreError> {
        let mut seen = self.seen.lock().await;
        if seen.contains_key(&listing.id) {
            return Ok(());
        }

        // the id only becomes visible once the document holding it is on disk
        seen.insert(listing.id.clone(), listing.clone());
        let encoded = serde_json::to_vec_pretty(&*seen);
        seen.remove(&listing.id);
        let bytes = encoded?;

        let path = self.path.clone();
        let written = Arc::clone(&self.written);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut on_disk = written.lock().unwrap_or_else(PoisonError::into_inner);
            // an abandoned save finishing late must not roll back a newer document
            if *on_disk > generation {
                return Ok(());
            }
            write_document(&path, &bytes)?;
            *on_disk = generation;
            Ok(())
        })
        .await
        .context("dedup store writer task failed")??;
        seen.insert(listing.id.clone(), listing.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub require_tls: bool,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            require_tls: true,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared relational store. Uniqueness is enforced by the primary key and
/// inserts are `ON CONFLICT DO NOTHING`, so concurrent watchers never race.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and ensure the `seen_items` table exists. Any failure here is
    /// fatal for the caller: there is no sensible empty fallback for a
    /// shared database.
    pub async fn connect(database_url: &str, options: PgStoreOptions) -> anyhow::Result<Self> {
        let mut connect =
            PgConnectOptions::from_str(database_url).context("invalid database url")?;
        if options.require_tls {
            connect = connect.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect)
            .await
            .context("database unreachable")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS seen_items (
                id TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating seen_items table")?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for PostgresStore {
    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let row: Option<i32> = sqlx::query_scalar("SELECT 1 FROM seen_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("checking seen_items for {id}"))?;
        Ok(row.is_some())
    }

    async fn save(&self, listing: &Listing) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO seen_items (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(&listing.id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting {} into seen_items", listing.id))?;
        Ok(())
    }
}

/// Process-local store, nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    seen: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seen: Mutex::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.seen.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.seen.lock().await.contains(id))
    }

    async fn save(&self, listing: &Listing) -> Result<(), StoreError> {
        self.seen.lock().await.insert(listing.id.clone());
        Ok(())
    }
}
