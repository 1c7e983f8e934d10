use std::path::Path;

use log::{debug, warn};
use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use super::multi_response::MultiEngineResponse;
use crate::error::EngineError;

/// Analysis results per reduced FEN, kept in sqlite so several processes
/// (and later sessions) can share them.
#[derive(Clone)]
pub struct AnalysisCache {
    pool: Pool<Sqlite>,
}

impl AnalysisCache {
    pub async fn open(path: &Path) -> Result<AnalysisCache, EngineError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    pub async fn open_in_memory() -> Result<AnalysisCache, EngineError> {
        // a single connection, every new one would see its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(":memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: Pool<Sqlite>) -> Result<AnalysisCache, EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS analysis (
                fenm2 TEXT PRIMARY KEY,
                params TEXT NOT NULL,
                mrm TEXT NOT NULL
            );",
        )
        .execute(&pool)
        .await?;
        Ok(AnalysisCache { pool })
    }

    /// Any unreadable entry or one stored for other search parameters is a miss.
    pub async fn get(&self, fenm2: &str, params: &str) -> Option<MultiEngineResponse> {
        let row: Result<Option<(String, String)>, sqlx::Error> =
            sqlx::query_as("SELECT params, mrm FROM analysis WHERE fenm2 = ?")
                .bind(fenm2)
                .fetch_optional(&self.pool)
                .await;

        match row {
            Ok(Some((stored_params, json))) if stored_params == params => {
                match serde_json::from_str(&json) {
                    Ok(mrm) => Some(mrm),
                    Err(e) => {
                        warn!("discarding unreadable cache entry for {fenm2}: {e}");
                        None
                    }
                }
            }
            Ok(Some(_)) => {
                debug!("cache entry for {fenm2} was made with other parameters");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("cache lookup for {fenm2} failed: {e}");
                None
            }
        }
    }

    pub async fn put(
        &self,
        fenm2: &str,
        params: &str,
        mrm: &MultiEngineResponse,
    ) -> Result<(), EngineError> {
        let json = serde_json::to_string(mrm)?;
        sqlx::query("INSERT OR REPLACE INTO analysis (fenm2, params, mrm) VALUES (?, ?, ?)")
            .bind(fenm2)
            .bind(params)
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM analysis")
            .fetch_one(&self.pool)
            .await
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    async fn put_raw(&self, fenm2: &str, params: &str, raw: &str) {
        sqlx::query("INSERT OR REPLACE INTO analysis (fenm2, params, mrm) VALUES (?, ?, ?)")
            .bind(fenm2)
            .bind(params)
            .bind(raw)
            .execute(&self.pool)
            .await
            .unwrap();
    }
}
