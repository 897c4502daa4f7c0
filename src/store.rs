use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::StoreSettings;
use crate::error::{Error, Result};
use crate::models::{Chunk, ChunkRef, FileMeta, VideoStatus};

/// Store schema version.
///
/// Bump this when the layout changes. Stores written with an older version
/// are wiped on open; a newer version is refused.
const SCHEMA_VERSION: i64 = 1;

/// Persistent chunk store.
///
/// Three record collections:
/// - `videos`: one [`VideoStatus`] per video
/// - `files`: one [`FileMeta`] per downloadable resource, indexed by video
/// - `chunks`: byte-range slices, unique on `(url, range_start, range_end)`
///
/// Notes:
/// - Wraps a single `rusqlite::Connection`, which is `Send` but not `Sync`.
///   Share it as `Arc<tokio::sync::Mutex<ChunkStore>>`.
/// - Every multi-record write runs in one transaction.
pub struct ChunkStore {
    conn: Connection,
    path: Option<PathBuf>,
}

/// Rows deleted by [`ChunkStore::remove_video`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedRows {
    pub videos: usize,
    pub files: usize,
    pub chunks: usize,
}

impl ChunkStore {
    /// Open (or create) the store described by `settings` and apply
    /// migrations. Any failure here is `StoreUnavailable`.
    pub fn open(settings: &StoreSettings) -> Result<Self> {
        let path = settings.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                Error::StoreUnavailable(format!("create store dir {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| Error::StoreUnavailable(format!("open {}: {}", path.display(), e)))?;

        // WAL keeps readers unblocked while a commit is in flight.
        conn.pragma_update(None, "journal_mode", "WAL")
            .and_then(|_| conn.pragma_update(None, "synchronous", "NORMAL"))
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        let mut store = Self {
            conn,
            path: Some(path),
        };
        store.init(settings.max_bytes)?;
        log::info!("Opened chunk store at {}", settings.path.display());
        Ok(store)
    }

    /// Volatile store, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        let mut store = Self { conn, path: None };
        store.init(None)?;
        Ok(store)
    }

    fn init(&mut self, max_bytes: Option<u64>) -> Result<()> {
        migrate(&mut self.conn).map_err(|e| match e {
            Error::StoreUnavailable(_) => e,
            other => Error::StoreUnavailable(other.to_string()),
        })?;
        if let Some(max) = max_bytes {
            self.set_max_bytes(max)
                .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Cap the database size. Writes that would grow past it fail with
    /// `QuotaExceeded`. The cap never drops below the current size.
    pub fn set_max_bytes(&mut self, max_bytes: u64) -> Result<()> {
        let page_size: i64 = self.conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let pages = (max_bytes / page_size.max(1) as u64).max(1) as i64;
        self.conn.pragma_update(None, "max_page_count", pages)?;
        log::debug!("Store capped at {} pages of {} bytes", pages, page_size);
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::from(e))
    }

    /// Write one flush as a unit: upsert the video status, insert the chunk,
    /// upsert the file meta. Either all three land or none do.
    ///
    /// Empty chunks (the terminal flush of a file whose length is a multiple
    /// of the chunk size) are not stored; the metadata still is.
    pub fn commit(&mut self, status: &VideoStatus, chunk: &Chunk, file: &FileMeta) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO videos (video_id, done, timestamp) VALUES (?1, ?2, ?3)
            ON CONFLICT(video_id) DO UPDATE SET
              done = excluded.done,
              timestamp = excluded.timestamp
            "#,
            params![status.video_id, status.done, status.timestamp],
        )?;

        if !chunk.is_empty() {
            tx.execute(
                r#"
                INSERT INTO chunks (url, range_start, range_end, data)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    chunk.url,
                    to_sql_int(chunk.range_start),
                    to_sql_int(chunk.range_end),
                    &chunk.data[..]
                ],
            )?;
        }

        tx.execute(
            r#"
            INSERT INTO files (
              url, video_id, download_url, mime_type,
              bytes_downloaded, bytes_total, done
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(url) DO UPDATE SET
              video_id = excluded.video_id,
              download_url = excluded.download_url,
              mime_type = excluded.mime_type,
              bytes_downloaded = excluded.bytes_downloaded,
              bytes_total = excluded.bytes_total,
              done = excluded.done
            "#,
            params![
                file.url,
                file.video_id,
                file.download_url,
                file.mime_type,
                to_sql_int(file.bytes_downloaded),
                file.bytes_total.map(to_sql_int),
                file.done
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_video(&self, video_id: &str) -> Result<Option<VideoStatus>> {
        let row = self
            .conn
            .query_row(
                "SELECT video_id, done, timestamp FROM videos WHERE video_id = ?1",
                params![video_id],
                row_to_video,
            )
            .optional()?;
        Ok(row)
    }

    /// All videos, most recently written first.
    pub fn list_videos(&self) -> Result<Vec<VideoStatus>> {
        let mut stmt = self.conn.prepare(
            "SELECT video_id, done, timestamp FROM videos ORDER BY timestamp DESC, video_id ASC",
        )?;
        let rows = stmt.query_map([], row_to_video)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_file(&self, url: &str) -> Result<Option<FileMeta>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE url = ?1"),
                params![url],
                row_to_file,
            )
            .optional()?;
        Ok(row)
    }

    /// Files of a video in the order they were first written.
    pub fn files_for_video(&self, video_id: &str) -> Result<Vec<FileMeta>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE video_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![video_id], row_to_file)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Chunks of `url` overlapping `[from, to]`, ordered by `range_start`.
    /// Payloads are not loaded.
    pub fn chunk_refs(&self, url: &str, from: u64, to: u64) -> Result<Vec<ChunkRef>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, range_start, range_end
            FROM chunks
            WHERE url = ?1 AND range_end >= ?2 AND range_start <= ?3
            ORDER BY range_start ASC
            "#,
        )?;
        let rows = stmt.query_map(params![url, to_sql_int(from), to_sql_int(to)], |r| {
            Ok(ChunkRef {
                id: r.get(0)?,
                range_start: from_sql_int(r.get(1)?),
                range_end: from_sql_int(r.get(2)?),
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn chunk_data(&self, id: i64) -> Result<Option<Bytes>> {
        let data = self
            .conn
            .query_row("SELECT data FROM chunks WHERE id = ?1", params![id], |r| {
                r.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(data.map(Bytes::from))
    }

    /// Every chunk of `url` with payload, in range order.
    pub fn chunks_for_url(&self, url: &str) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT url, range_start, range_end, data
            FROM chunks
            WHERE url = ?1
            ORDER BY range_start ASC
            "#,
        )?;
        let rows = stmt.query_map(params![url], |r| {
            Ok(Chunk {
                url: r.get(0)?,
                range_start: from_sql_int(r.get(1)?),
                range_end: from_sql_int(r.get(2)?),
                data: Bytes::from(r.get::<_, Vec<u8>>(3)?),
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_chunks(&self, url: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE url = ?1",
            params![url],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete the chunks of `url` starting at or after `from`.
    pub fn delete_chunks_from(&mut self, url: &str, from: u64) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM chunks WHERE url = ?1 AND range_start >= ?2",
            params![url, to_sql_int(from)],
        )?;
        Ok(n)
    }

    /// Payload bytes stored for a video.
    pub fn stored_bytes(&self, video_id: &str) -> Result<u64> {
        let total: i64 = self.conn.query_row(
            r#"
            SELECT COALESCE(SUM(LENGTH(c.data)), 0)
            FROM chunks c
            JOIN files f ON f.url = c.url
            WHERE f.video_id = ?1
            "#,
            params![video_id],
            |r| r.get(0),
        )?;
        Ok(total as u64)
    }

    /// Delete a video, its files and all their chunks.
    pub fn remove_video(&mut self, video_id: &str) -> Result<RemovedRows> {
        let tx = self.conn.transaction()?;
        let chunks = tx.execute(
            "DELETE FROM chunks WHERE url IN (SELECT url FROM files WHERE video_id = ?1)",
            params![video_id],
        )?;
        let files = tx.execute("DELETE FROM files WHERE video_id = ?1", params![video_id])?;
        let videos = tx.execute("DELETE FROM videos WHERE video_id = ?1", params![video_id])?;
        tx.commit()?;

        log::info!(
            "Removed video {} ({} files, {} chunks)",
            video_id,
            files,
            chunks
        );
        Ok(RemovedRows {
            videos,
            files,
            chunks,
        })
    }

    /// Delete every record in all three collections.
    pub fn clear_all(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            r#"
            DELETE FROM chunks;
            DELETE FROM files;
            DELETE FROM videos;
            "#,
        )?;
        tx.commit()?;
        log::info!("Cleared chunk store");
        Ok(())
    }
}

const FILE_COLUMNS: &str =
    "url, video_id, download_url, mime_type, bytes_downloaded, bytes_total, done";

fn row_to_video(row: &Row) -> rusqlite::Result<VideoStatus> {
    Ok(VideoStatus {
        video_id: row.get(0)?,
        done: row.get(1)?,
        timestamp: row.get(2)?,
    })
}

fn row_to_file(row: &Row) -> rusqlite::Result<FileMeta> {
    let bytes_total: Option<i64> = row.get(5)?;
    Ok(FileMeta {
        url: row.get(0)?,
        video_id: row.get(1)?,
        download_url: row.get(2)?,
        mime_type: row.get(3)?,
        bytes_downloaded: from_sql_int(row.get(4)?),
        bytes_total: bytes_total.map(from_sql_int),
        done: row.get(6)?,
    })
}

// SQLite integers are signed 64-bit; byte offsets never come close to i64::MAX.
fn to_sql_int(v: u64) -> i64 {
    v as i64
}

fn from_sql_int(v: i64) -> u64 {
    v.max(0) as u64
}

/// Apply migrations to bring the store to the current schema.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |r| r.get(0),
        )
        .optional()?;

    // Unreadable versions are treated as incompatible, and so are
    // unversioned tables left behind by an older layout.
    let current_version: Option<i64> = match existing.as_deref() {
        None if has_media_tables(conn)? => None,
        None => Some(0),
        Some(s) => s.parse::<i64>().ok(),
    };

    match current_version {
        Some(v) if v > SCHEMA_VERSION => {
            return Err(Error::StoreUnavailable(format!(
                "store schema version {} is newer than supported {}",
                v, SCHEMA_VERSION
            )));
        }
        Some(v) if v == SCHEMA_VERSION => return Ok(()),
        Some(0) => {}
        Some(_) | None => {
            log::warn!(
                "Store schema version {:?} is incompatible, wiping stored media",
                existing
            );
            wipe(conn)?;
        }
    }

    migration_v1(conn)?;
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

fn has_media_tables(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM sqlite_master
        WHERE type = 'table' AND name IN ('videos', 'files', 'chunks')
        "#,
        [],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn wipe(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS chunks;
        DROP TABLE IF EXISTS files;
        DROP TABLE IF EXISTS videos;
        "#,
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
          video_id TEXT PRIMARY KEY,
          done INTEGER NOT NULL,
          timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_videos_timestamp ON videos(timestamp);

        CREATE TABLE IF NOT EXISTS files (
          url TEXT PRIMARY KEY,
          video_id TEXT NOT NULL,
          download_url TEXT NOT NULL,
          mime_type TEXT NULL,
          bytes_downloaded INTEGER NOT NULL,
          bytes_total INTEGER NULL,
          done INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_files_video_id ON files(video_id);

        CREATE TABLE IF NOT EXISTS chunks (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          url TEXT NOT NULL,
          range_start INTEGER NOT NULL,
          range_end INTEGER NOT NULL,
          data BLOB NOT NULL,
          UNIQUE(url, range_start, range_end)
        );
        "#,
    )?;

    Ok(())
}
