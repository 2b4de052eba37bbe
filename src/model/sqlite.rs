/*!
SQLite memory store

Async `MemoryStore` implementation over an `sqlx` pool.

## Behavior

- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling
  the feature assumes external migration orchestration.
- `sqlite::memory:` URLs clamp the pool to a single connection so every
  acquire observes the same database.
- Vectors persist as little-endian `f32` BLOBs; chunk metadata as a JSON
  column validated into [`ChunkMetadata`](super::ChunkMetadata) on read.
- Status transitions are guarded in the statements themselves
  (`WHERE processing_status = 'pending'`), so terminal states never
  regress regardless of caller interleaving.

## Schema mapping

- `raw_records` ← [`RawRecord`](super::RawRecord), `dedup_key` unique when present
- `chunks` ← [`Chunk`](super::Chunk), `(raw_record_id, chunk_index)` unique
- `episodes` / `chunk_episodes` ← membership drives centroid updates
- `thoughts` / `episode_thoughts` ← weighted insight links
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use crate::types::{
    ChunkId, ChunkStatus, ContentType, EpisodeId, RawRecordId, RecordStatus, ThoughtId, UserId,
};
use crate::vectors::math::online_mean;

use super::store::{MemoryStore, StoreError};
use super::{
    AttachOutcome, Chunk, ChunkMetadata, Episode, EpisodeThoughtLink, NewChunk, NewEpisode,
    NewThought, RawRecord, RawRecordDraft, Thought,
};

/// Truncation bound for persisted error notes.
const ERROR_NOTE_MAX: usize = 1000;

/// SQLite-backed canonical store.
pub struct SqliteMemoryStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMemoryStore").finish()
    }
}

/// Encode a vector as a little-endian f32 blob.
fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode a little-endian f32 blob. Trailing partial words are dropped.
fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn truncate_note(note: &str) -> String {
    if note.len() <= ERROR_NOTE_MAX {
        return note.to_string();
    }
    let mut end = ERROR_NOTE_MAX;
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    note[..end].to_string()
}

fn parse_uuid(raw: &str, what: &'static str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Backend(format!("corrupt {what} id: {raw}")))
}

fn row_to_record(row: &SqliteRow) -> Result<RawRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let content_type: String = row.try_get("content_type")?;
    let status: String = row.try_get("processing_status")?;
    Ok(RawRecord {
        id: parse_uuid(&id, "raw record")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        content_type: ContentType::decode(&content_type)
            .ok_or_else(|| StoreError::Backend(format!("corrupt content_type: {content_type}")))?,
        content: row.try_get("content")?,
        perspective_owner_id: row.try_get("perspective_owner_id")?,
        subject_id: row.try_get("subject_id")?,
        topic_key: row.try_get("topic_key")?,
        importance_score: row.try_get("importance_score")?,
        processing_status: RecordStatus::decode(&status)
            .ok_or_else(|| StoreError::Backend(format!("corrupt record status: {status}")))?,
        skip_importance_check: row.try_get::<i64, _>("skip_importance_check")? != 0,
        dedup_key: row.try_get("dedup_key")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        processing_error: row.try_get("processing_error")?,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk, StoreError> {
    let id: String = row.try_get("id")?;
    let record_id: String = row.try_get("raw_record_id")?;
    let status: String = row.try_get("processing_status")?;
    let metadata: String = row.try_get("metadata")?;
    let vector: Option<Vec<u8>> = row.try_get("vector")?;
    Ok(Chunk {
        id: parse_uuid(&id, "chunk")?,
        raw_record_id: parse_uuid(&record_id, "raw record")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        text: row.try_get("text")?,
        index: row.try_get::<i64, _>("chunk_index")? as u32,
        token_count: row.try_get::<i64, _>("token_count")? as u32,
        importance_score: row.try_get("importance_score")?,
        vector: vector.map(|blob| blob_to_vec(&blob)),
        processing_status: ChunkStatus::decode(&status)
            .ok_or_else(|| StoreError::Backend(format!("corrupt chunk status: {status}")))?,
        metadata: serde_json::from_str::<ChunkMetadata>(&metadata)?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_episode(row: &SqliteRow) -> Result<Episode, StoreError> {
    let id: String = row.try_get("id")?;
    let centroid: Vec<u8> = row.try_get("centroid")?;
    Ok(Episode {
        id: parse_uuid(&id, "episode")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        narrative: row.try_get("narrative")?,
        centroid: blob_to_vec(&centroid),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_thought(row: &SqliteRow) -> Result<Thought, StoreError> {
    let id: String = row.try_get("id")?;
    let vector: Vec<u8> = row.try_get("vector")?;
    Ok(Thought {
        id: parse_uuid(&id, "thought")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        vector: blob_to_vec(&vector),
        importance: row.try_get("importance")?,
        created_at: row.try_get("created_at")?,
    })
}

const CHUNK_COLUMNS: &str = "id, raw_record_id, user_id, session_id, text, chunk_index, \
     token_count, importance_score, vector, processing_status, metadata, created_at";

impl SqliteMemoryStore {
    /// Connect (or create) the database at `database_url` and bootstrap the
    /// schema.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let options = database_url
            .parse::<SqliteConnectOptions>()
            .map_err(|e| StoreError::Backend(format!("bad database url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("connect error: {e}")))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(StoreError::Backend(format!("migration failure: {e}")));
            }
        }
        Ok(Self { pool })
    }

    /// Access to the pool for maintenance tooling.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    #[instrument(skip(self, draft), fields(user_id = %draft.user_id))]
    async fn insert_raw_record(&self, draft: RawRecordDraft) -> Result<RawRecord, StoreError> {
        if draft.user_id.trim().is_empty() {
            return Err(StoreError::InvalidInput("missing userId".into()));
        }
        if draft.content.trim().is_empty() {
            return Err(StoreError::InvalidInput("empty content".into()));
        }

        let id = Uuid::new_v4();
        let created_at = draft.created_at.unwrap_or_else(Utc::now);
        let perspective = draft
            .perspective_owner_id
            .clone()
            .unwrap_or_else(|| draft.user_id.clone());
        let subject = draft
            .subject_id
            .clone()
            .unwrap_or_else(|| draft.user_id.clone());

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO raw_records (
                id, user_id, session_id, content_type, content,
                perspective_owner_id, subject_id, topic_key,
                importance_score, processing_status, skip_importance_check,
                dedup_key, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?11, ?12)
            "#,
        )
        .bind(id.to_string())
        .bind(&draft.user_id)
        .bind(&draft.session_id)
        .bind(draft.content_type.encode())
        .bind(&draft.content)
        .bind(&perspective)
        .bind(&subject)
        .bind(&draft.topic_key)
        .bind(draft.importance_score)
        .bind(i64::from(draft.skip_importance_check))
        .bind(&draft.dedup_key)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Dedup key collision: hand back the canonical record.
            if let Some(key) = &draft.dedup_key {
                let row = sqlx::query("SELECT * FROM raw_records WHERE dedup_key = ?1")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await?;
                return row_to_record(&row);
            }
            return Err(StoreError::Backend("insert raw record: no row".into()));
        }

        Ok(RawRecord {
            id,
            user_id: draft.user_id,
            session_id: draft.session_id,
            content_type: draft.content_type,
            content: draft.content,
            perspective_owner_id: perspective,
            subject_id: subject,
            topic_key: draft.topic_key,
            importance_score: draft.importance_score,
            processing_status: RecordStatus::Pending,
            skip_importance_check: draft.skip_importance_check,
            dedup_key: draft.dedup_key,
            created_at,
            processed_at: None,
            processing_error: None,
        })
    }

    async fn get_raw_record(&self, id: RawRecordId) -> Result<Option<RawRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM raw_records WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn set_record_importance(&self, id: RawRecordId, score: f64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE raw_records SET importance_score = ?2 \
             WHERE id = ?1 AND importance_score IS NULL",
        )
        .bind(id.to_string())
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn mark_record_status(
        &self,
        id: RawRecordId,
        status: RecordStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let processed_at = status.is_terminal().then(Utc::now);
        sqlx::query(
            "UPDATE raw_records \
             SET processing_status = ?2, processed_at = ?3, processing_error = ?4 \
             WHERE id = ?1 AND processing_status = 'pending'",
        )
        .bind(id.to_string())
        .bind(status.encode())
        .bind(processed_at)
        .bind(error.map(truncate_note))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_error_note(&self, id: RawRecordId, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE raw_records SET processing_error = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(truncate_note(error))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_record_processed_if_complete(
        &self,
        id: RawRecordId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE raw_records SET processing_status = 'processed', processed_at = ?2
            WHERE id = ?1 AND processing_status = 'pending'
              AND EXISTS (SELECT 1 FROM chunks WHERE raw_record_id = ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM chunks
                  WHERE raw_record_id = ?1
                    AND processing_status IN ('pending', 'pending_vector', 'embedding_error')
              )
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    async fn insert_chunks(&self, chunks: Vec<NewChunk>) -> Result<Vec<Chunk>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(chunks.len());
        for new in chunks {
            let id = Uuid::new_v4();
            let created_at = Utc::now();
            let metadata = serde_json::to_string(&new.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO chunks (
                    id, raw_record_id, user_id, session_id, text, chunk_index,
                    token_count, importance_score, processing_status, metadata, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10)
                "#,
            )
            .bind(id.to_string())
            .bind(new.raw_record_id.to_string())
            .bind(&new.user_id)
            .bind(&new.session_id)
            .bind(&new.text)
            .bind(i64::from(new.index))
            .bind(i64::from(new.token_count))
            .bind(new.importance_score)
            .bind(&metadata)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
            inserted.push(Chunk {
                id,
                raw_record_id: new.raw_record_id,
                user_id: new.user_id,
                session_id: new.session_id,
                text: new.text,
                index: new.index,
                token_count: new.token_count,
                importance_score: new.importance_score,
                vector: None,
                processing_status: ChunkStatus::Pending,
                metadata: new.metadata,
                created_at,
            });
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>, StoreError> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn set_chunk_vector(&self, id: ChunkId, vector: &[f32]) -> Result<(), StoreError> {
        sqlx::query("UPDATE chunks SET vector = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(vec_to_blob(vector))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_chunks_status(
        &self,
        ids: &[ChunkId],
        status: ChunkStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE chunks SET processing_status = ?2 WHERE id = ?1")
                .bind(id.to_string())
                .bind(status.encode())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn chunks_for_record(&self, record_id: RawRecordId) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE raw_record_id = ?1 ORDER BY chunk_index"
        ))
        .bind(record_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn orphan_chunks(&self, user_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE user_id = ?1 \
               AND id NOT IN (SELECT chunk_id FROM chunk_episodes) \
             ORDER BY created_at, chunk_index"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn chunks_with_status(
        &self,
        status: ChunkStatus,
        limit: usize,
    ) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE processing_status = ?1 ORDER BY created_at LIMIT ?2"
        ))
        .bind(status.encode())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn chunks_for_episode(
        &self,
        episode_id: EpisodeId,
        limit: usize,
    ) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT c.id as id, c.raw_record_id as raw_record_id, c.user_id as user_id, \
                    c.session_id as session_id, c.text as text, c.chunk_index as chunk_index, \
                    c.token_count as token_count, c.importance_score as importance_score, \
                    c.vector as vector, c.processing_status as processing_status, \
                    c.metadata as metadata, c.created_at as created_at \
             FROM chunks c \
             JOIN chunk_episodes ce ON ce.chunk_id = c.id \
             WHERE ce.episode_id = ?1 \
             ORDER BY ce.linked_at, c.chunk_index \
             LIMIT ?2"
        ))
        .bind(episode_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    #[instrument(skip(self, episode), fields(user_id = %episode.user_id))]
    async fn insert_episode(&self, episode: NewEpisode) -> Result<Episode, StoreError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO episodes (id, user_id, title, narrative, centroid, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(&episode.user_id)
        .bind(&episode.title)
        .bind(&episode.narrative)
        .bind(vec_to_blob(&episode.centroid))
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(Episode {
            id,
            user_id: episode.user_id,
            title: episode.title,
            narrative: episode.narrative,
            centroid: episode.centroid,
            created_at,
        })
    }

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError> {
        let row = sqlx::query("SELECT * FROM episodes WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_episode).transpose()
    }

    async fn recent_episodes(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Episode>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM episodes \
             WHERE user_id = ?1 AND created_at >= ?2 \
             ORDER BY created_at DESC LIMIT ?3",
        )
        .bind(user_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_episode).collect()
    }

    async fn latest_episodes(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Episode>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM episodes WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_episode).collect()
    }

    #[instrument(skip(self, chunk_vector))]
    async fn attach_chunk_to_episode(
        &self,
        chunk_id: ChunkId,
        episode_id: EpisodeId,
        chunk_vector: &[f32],
    ) -> Result<AttachOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let chunk_user: Option<String> = sqlx::query("SELECT user_id FROM chunks WHERE id = ?1")
            .bind(chunk_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("user_id"))
            .transpose()?;
        let chunk_user = chunk_user.ok_or(StoreError::NotFound { what: "chunk" })?;

        let episode_row = sqlx::query("SELECT user_id, centroid FROM episodes WHERE id = ?1")
            .bind(episode_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound { what: "episode" })?;
        let episode_user: UserId = episode_row.try_get("user_id")?;
        let centroid_blob: Vec<u8> = episode_row.try_get("centroid")?;
        let centroid = blob_to_vec(&centroid_blob);

        if chunk_user != episode_user {
            return Err(StoreError::UserMismatch {
                chunk_user,
                episode_user,
            });
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO chunk_episodes (chunk_id, episode_id, linked_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(chunk_id.to_string())
        .bind(episode_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let member_count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM chunk_episodes WHERE episode_id = ?1")
                .bind(episode_id.to_string())
                .fetch_one(&mut *tx)
                .await?
                .try_get("n")?;

        if result.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(AttachOutcome {
                inserted: false,
                member_count: member_count as u64,
                centroid,
            });
        }

        let new_centroid = if member_count <= 1 {
            chunk_vector.to_vec()
        } else {
            if centroid.len() != chunk_vector.len() {
                return Err(StoreError::InvalidInput(format!(
                    "centroid dimension {} does not match chunk vector {}",
                    centroid.len(),
                    chunk_vector.len()
                )));
            }
            online_mean(&centroid, (member_count - 1) as usize, chunk_vector)
        };

        sqlx::query("UPDATE episodes SET centroid = ?2 WHERE id = ?1")
            .bind(episode_id.to_string())
            .bind(vec_to_blob(&new_centroid))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(AttachOutcome {
            inserted: true,
            member_count: member_count as u64,
            centroid: new_centroid,
        })
    }

    async fn link_chunks_bulk(
        &self,
        episode_id: EpisodeId,
        chunk_ids: &[ChunkId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let episode_user: String = sqlx::query("SELECT user_id FROM episodes WHERE id = ?1")
            .bind(episode_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound { what: "episode" })?
            .try_get("user_id")?;

        for chunk_id in chunk_ids {
            let chunk_user: String = sqlx::query("SELECT user_id FROM chunks WHERE id = ?1")
                .bind(chunk_id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(StoreError::NotFound { what: "chunk" })?
                .try_get("user_id")?;
            if chunk_user != episode_user {
                return Err(StoreError::UserMismatch {
                    chunk_user,
                    episode_user,
                });
            }
            sqlx::query(
                "INSERT OR IGNORE INTO chunk_episodes (chunk_id, episode_id, linked_at) \
                 VALUES (?1, ?2, ?3)",
            )
            .bind(chunk_id.to_string())
            .bind(episode_id.to_string())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn episode_member_count(&self, episode_id: EpisodeId) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM chunk_episodes WHERE episode_id = ?1")
                .bind(episode_id.to_string())
                .fetch_one(&self.pool)
                .await?
                .try_get("n")?;
        Ok(count as u64)
    }

    #[instrument(skip(self, thought), fields(user_id = %thought.user_id))]
    async fn insert_thought(&self, thought: NewThought) -> Result<Thought, StoreError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO thoughts (id, user_id, name, description, vector, importance, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id.to_string())
        .bind(&thought.user_id)
        .bind(&thought.name)
        .bind(&thought.description)
        .bind(vec_to_blob(&thought.vector))
        .bind(thought.importance)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(Thought {
            id,
            user_id: thought.user_id,
            name: thought.name,
            description: thought.description,
            vector: thought.vector,
            importance: thought.importance,
            created_at,
        })
    }

    async fn get_thought(&self, id: ThoughtId) -> Result<Option<Thought>, StoreError> {
        let row = sqlx::query("SELECT * FROM thoughts WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_thought).transpose()
    }

    async fn link_episode_thought(&self, link: EpisodeThoughtLink) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO episode_thoughts (episode_id, thought_id, weight) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(link.episode_id.to_string())
        .bind(link.thought_id.to_string())
        .bind(link.weight)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn thought_links(
        &self,
        thought_id: ThoughtId,
    ) -> Result<Vec<EpisodeThoughtLink>, StoreError> {
        let rows = sqlx::query(
            "SELECT episode_id, thought_id, weight FROM episode_thoughts WHERE thought_id = ?1",
        )
        .bind(thought_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let episode: String = row.try_get("episode_id")?;
                let thought: String = row.try_get("thought_id")?;
                Ok(EpisodeThoughtLink {
                    episode_id: parse_uuid(&episode, "episode")?,
                    thought_id: parse_uuid(&thought, "thought")?,
                    weight: row.try_get("weight")?,
                })
            })
            .collect()
    }

    async fn episode_ids_with_thoughts(
        &self,
        user_id: &str,
    ) -> Result<Vec<EpisodeId>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT et.episode_id AS episode_id \
             FROM episode_thoughts et \
             JOIN episodes e ON e.id = et.episode_id \
             WHERE e.user_id = ?1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("episode_id")?;
                parse_uuid(&id, "episode")
            })
            .collect()
    }

    async fn list_user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT user_id FROM raw_records ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn pending_records(&self, limit: usize) -> Result<Vec<RawRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM raw_records WHERE processing_status = 'pending' \
             ORDER BY created_at LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn chunks_with_vectors(&self, user_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE user_id = ?1 AND vector IS NOT NULL ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn episodes_for_user(&self, user_id: &str) -> Result<Vec<Episode>, StoreError> {
        let rows = sqlx::query("SELECT * FROM episodes WHERE user_id = ?1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_episode).collect()
    }

    async fn thoughts_for_user(&self, user_id: &str) -> Result<Vec<Thought>, StoreError> {
        let rows = sqlx::query("SELECT * FROM thoughts WHERE user_id = ?1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_thought).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
