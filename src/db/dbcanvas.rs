use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::store::{Operation, Stroke, StrokeId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One row of `canvas_strokes`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StrokeRow {
    pub stroke_id: String,
    pub stroke: Option<Json<Stroke>>,
    pub deleted: bool,
}

impl StrokeRow {
    /// The operation that replays this row into a document.
    pub fn into_operation(self) -> Option<Operation> {
        if self.deleted {
            return Some(Operation::Delete { stroke_ids: vec![self.stroke_id] });
        }
        match self.stroke {
            Some(Json(stroke)) => Some(Operation::Insert { stroke }),
            None => {
                warn!("Stroke row {} has no body and no tombstone, skipping", self.stroke_id);
                None
            }
        }
    }
}

/// Best-effort stroke store.
///
/// Rows are keyed by `(board, stroke_id)`. Tombstones are rows too, and a
/// stroke upsert never clears `deleted`, so writes arriving in any order
/// cannot bring a deleted stroke back.
pub struct StrokeStore {
    pool: PgPool,
}

impl StrokeStore {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to stroke store...");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("Stroke store connection pool created successfully");

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let ddl = r#"
            CREATE TABLE IF NOT EXISTS canvas_strokes (
                board       TEXT        NOT NULL,
                stroke_id   TEXT        NOT NULL,
                stroke      JSONB       NULL,
                deleted     BOOLEAN     NOT NULL DEFAULT FALSE,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (board, stroke_id)
            )
        "#;
        sqlx::query(ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Load every row of a board as replayable operations, oldest first.
    pub async fn load_board(&self, board: &str) -> Result<Vec<Operation>, StoreError> {
        let query_sql = r#"
            SELECT stroke_id, stroke, deleted
            FROM canvas_strokes
            WHERE board = $1
            ORDER BY created_at, stroke_id
        "#;

        let rows = sqlx::query_as::<_, StrokeRow>(query_sql)
            .bind(board)
            .fetch_all(&self.pool)
            .await?;

        info!("Loaded {} stroke rows for board '{}'", rows.len(), board);
        Ok(rows.into_iter().filter_map(StrokeRow::into_operation).collect())
    }

    pub async fn save_stroke(&self, board: &str, stroke: &Stroke) -> Result<(), StoreError> {
        let query_sql = r#"
            INSERT INTO canvas_strokes (board, stroke_id, stroke, deleted, created_at, updated_at)
            VALUES ($1, $2, $3, FALSE, $4, now())
            ON CONFLICT (board, stroke_id) DO UPDATE
                SET stroke = EXCLUDED.stroke,
                    updated_at = now()
                WHERE canvas_strokes.deleted = FALSE
        "#;

        sqlx::query(query_sql)
            .bind(board)
            .bind(&stroke.id)
            .bind(Json(stroke))
            .bind(stroke.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_strokes(&self, board: &str, stroke_ids: &[StrokeId]) -> Result<(), StoreError> {
        if stroke_ids.is_empty() {
            return Ok(());
        }

        let query_sql = r#"
            INSERT INTO canvas_strokes (board, stroke_id, stroke, deleted)
            SELECT $1, id, NULL, TRUE FROM unnest($2::text[]) AS id
            ON CONFLICT (board, stroke_id) DO UPDATE
                SET stroke = NULL,
                    deleted = TRUE,
                    updated_at = now()
        "#;

        sqlx::query(query_sql)
            .bind(board)
            .bind(stroke_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistJob {
    SaveStroke(Stroke),
    DeleteStrokes(Vec<StrokeId>),
}

/// Queue in front of the persistence worker. Never blocks the caller.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistJob>,
}

impl PersistHandle {
    pub fn new(tx: mpsc::Sender<PersistJob>) -> Self {
        Self { tx }
    }

    pub fn submit(&self, job: PersistJob) {
        if let Err(e) = self.tx.try_send(job) {
            warn!("Persistence queue unavailable, write skipped: {}", e);
        }
    }
}

pub fn spawn_persist_worker(store: Arc<StrokeStore>, board: String, capacity: usize) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PersistJob>(capacity);

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = match &job {
                PersistJob::SaveStroke(stroke) => store.save_stroke(&board, stroke).await,
                PersistJob::DeleteStrokes(ids) => store.delete_strokes(&board, ids).await,
            };
            if let Err(e) = result {
                error!("Failed to persist {}: {}", job_label(&job), e);
            }
        }
        info!("Persistence worker stopped");
    });

    (PersistHandle::new(tx), handle)
}

fn job_label(job: &PersistJob) -> String {
    match job {
        PersistJob::SaveStroke(stroke) => format!("stroke {}", stroke.id),
        PersistJob::DeleteStrokes(ids) => format!("{} tombstones", ids.len()),
    }
}
