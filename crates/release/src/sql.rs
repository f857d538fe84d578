//! SQLite-backed release history. Synchronous; one lookup per invocation.

use metrics::histogram;
use patchdiff_core::Result;

use crate::{decode_payload, encode_payload, lookup_err, Release, ReleaseStore};

pub struct SqliteDriver {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteDriver {
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .map_err(|e| lookup_err("", format!("opening sqlite db at {}: {}", path, e)))?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS releases (
                key       TEXT PRIMARY KEY,
                name      TEXT NOT NULL,
                namespace TEXT NOT NULL,
                version   INTEGER NOT NULL,
                status    TEXT NOT NULL,
                body      TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| lookup_err("", format!("creating releases table: {}", e)))?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_releases_name ON releases(name, version DESC)", []).ok();
        histogram!("release_sql_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    /// Store a record under `sh.helm.release.v1.<name>.v<version>`.
    pub fn create(&self, rel: &Release) -> Result<()> {
        let body = encode_payload(rel).map_err(|e| lookup_err(&rel.name, e))?;
        let key = format!("sh.helm.release.v1.{}.v{}", rel.name, rel.version);
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "INSERT OR REPLACE INTO releases(key, name, namespace, version, status, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&key, &rel.name, &rel.namespace, rel.version, rel.status().as_str(), &body),
        )
        .map_err(|e| lookup_err(&rel.name, e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReleaseStore for SqliteDriver {
    async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = db
            .prepare("SELECT key, body FROM releases WHERE name = ?1 ORDER BY version DESC")
            .map_err(|e| lookup_err(name, e.to_string()))?;
        let mut rows = stmt.query([name]).map_err(|e| lookup_err(name, e.to_string()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| lookup_err(name, e.to_string()))? {
            let key: String = row.get(0).map_err(|e| lookup_err(name, e.to_string()))?;
            let body: String = row.get(1).map_err(|e| lookup_err(name, e.to_string()))?;
            let rel = decode_payload(body.as_bytes()).map_err(|e| lookup_err(name, format!("{}: {}", key, e)))?;
            out.push(rel);
        }
        histogram!("release_sql_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}
