//! Delivered-content catalog backed by `delivered_content` / `delivered_part`.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::Result;
use crate::catalog::DeliveredStore;
use crate::database::models::{DeliveredContentDbModel, DeliveredPartDbModel, dub_column};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::database::{WritePool, begin_immediate};
use crate::domain::{DeliveredContent, MovieKey, normalize_source_url};

pub struct SqlxDeliveredRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxDeliveredRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    async fn with_parts(
        conn: &mut SqliteConnection,
        row: DeliveredContentDbModel,
    ) -> Result<DeliveredContent> {
        let parts = sqlx::query_as::<_, DeliveredPartDbModel>(
            "SELECT * FROM delivered_part WHERE content_ref = ? ORDER BY part_number",
        )
        .bind(row.id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(row.into_domain(parts))
    }
}

#[async_trait]
impl DeliveredStore for SqlxDeliveredRepository {
    async fn find(&self, key: &MovieKey) -> Result<Option<DeliveredContent>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, DeliveredContentDbModel>(
            "SELECT * FROM delivered_content WHERE content_id = ? AND lang = ? AND dub = ?",
        )
        .bind(&key.content_id)
        .bind(&key.lang)
        .bind(dub_column(key))
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::with_parts(&mut conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_source(&self, source_url: &str) -> Result<Vec<DeliveredContent>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, DeliveredContentDbModel>(
            "SELECT * FROM delivered_content WHERE source_url = ? ORDER BY created_at",
        )
        .bind(normalize_source_url(source_url))
        .fetch_all(&mut *conn)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Self::with_parts(&mut conn, row).await?);
        }
        Ok(out)
    }

    async fn record(&self, content: &DeliveredContent) -> Result<()> {
        let source_url = content.source_url.as_deref().map(normalize_source_url);
        let key = &content.movie_key;
        retry_on_sqlite_busy("record_delivered_content", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let (id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO delivered_content (
                    content_id, lang, dub, quality, source_url, title,
                    session_name, owner, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(content_id, lang, dub) DO UPDATE SET
                    quality = excluded.quality,
                    source_url = excluded.source_url,
                    title = excluded.title,
                    session_name = excluded.session_name,
                    owner = excluded.owner,
                    created_at = excluded.created_at
                RETURNING id
                "#,
            )
            .bind(&key.content_id)
            .bind(&key.lang)
            .bind(dub_column(key))
            .bind(&content.quality)
            .bind(&source_url)
            .bind(&content.title)
            .bind(&content.result_ref.session_name)
            .bind(&content.result_ref.owner)
            .bind(datetime_to_ms(content.created_at))
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM delivered_part WHERE content_ref = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            for part in &content.result_ref.parts {
                sqlx::query(
                    "INSERT INTO delivered_part (content_ref, part_number, file_ref) VALUES (?, ?, ?)",
                )
                .bind(id)
                .bind(i64::from(part.part_number))
                .bind(&part.file_ref)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool_with_size, init_write_pool, run_migrations};
    use crate::domain::{PartRef, ResultRef};
    use chrono::{TimeZone, Utc};

    async fn repo(dir: &tempfile::TempDir) -> SqlxDeliveredRepository {
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("catalog.db").display());
        let pool = init_pool_with_size(&url, 2).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let write_pool = init_write_pool(&url).await.unwrap();
        SqlxDeliveredRepository::new(pool, write_pool)
    }

    fn content(parts: &[&str]) -> DeliveredContent {
        DeliveredContent {
            movie_key: MovieKey::new("tt0113277", "ru", Some("Gavrilov".into())),
            quality: Some("720p".into()),
            source_url: Some("https://mirror.example/heat/?ref=bot".into()),
            title: Some("Heat".into()),
            result_ref: ResultRef {
                owner: "@relay_storage".into(),
                session_name: "acc-b".into(),
                parts: parts
                    .iter()
                    .enumerate()
                    .map(|(i, f)| PartRef {
                        part_number: i as u32 + 1,
                        file_ref: f.to_string(),
                    })
                    .collect(),
            },
            created_at: Utc.with_ymd_and_hms(2026, 5, 5, 5, 5, 5).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_record_and_find_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir).await;
        let item = content(&["f-1", "f-2", "f-3"]);
        repo.record(&item).await.unwrap();

        let found = repo.find(&item.movie_key).await.unwrap().unwrap();
        assert_eq!(found.result_ref, item.result_ref);
        assert_eq!(found.source_url.as_deref(), Some("https://mirror.example/heat"));
        assert!(found.result_ref.is_multipart());

        let other_dub = MovieKey::new("tt0113277", "ru", None);
        assert!(repo.find(&other_dub).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rerecord_replaces_parts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir).await;
        repo.record(&content(&["old-1", "old-2"])).await.unwrap();
        repo.record(&content(&["new-1"])).await.unwrap();

        let found = repo
            .find_by_source("https://mirror.example/heat")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].result_ref.parts.len(), 1);
        assert_eq!(found[0].result_ref.parts[0].file_ref, "new-1");
    }
}
