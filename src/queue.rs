//! Durable FIFO of posts waiting to be published.
//!
//! Every mutation runs under one async write guard and commits to SQLite before
//! returning; the live view is refreshed from the committed rows afterwards.

use crate::db::{self, Pool};
use crate::model::{FailedPost, PendingPost, PostDraft};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct QueueStore {
    pool: Pool,
    write_guard: Arc<Mutex<()>>,
    view: Arc<watch::Sender<Vec<PendingPost>>>,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("len", &self.view.borrow().len())
            .finish_non_exhaustive()
    }
}

impl QueueStore {
    /// Wrap an already migrated pool and load the current snapshot.
    pub async fn new(pool: Pool) -> Result<Self> {
        let snapshot = db::list_pending(&pool).await?;
        let (view, _) = watch::channel(snapshot);
        Ok(Self {
            pool,
            write_guard: Arc::new(Mutex::new(())),
            view: Arc::new(view),
        })
    }

    /// Open (or repair) the database at `database_url`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = db::open_or_repair(database_url).await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Persist `post` at the tail of the queue and return its id.
    pub async fn append(&self, post: &PostDraft) -> Result<i64> {
        let _guard = self.write_guard.lock().await;
        let id = db::insert_pending(&self.pool, post, Utc::now()).await?;
        info!(id, title = post.display_title(), "post queued");
        self.refresh_view().await;
        Ok(id)
    }

    pub async fn peek_oldest(&self) -> Result<Option<PendingPost>> {
        db::oldest_pending(&self.pool).await
    }

    /// Delete the post with `id`; absent ids are ignored.
    pub async fn remove(&self, id: i64) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        if db::delete_pending(&self.pool, id).await? {
            debug!(id, "post removed from queue");
            self.refresh_view().await;
        } else {
            debug!(id, "remove ignored; post not queued");
        }
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<PendingPost>> {
        db::list_pending(&self.pool).await
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(db::count_pending(&self.pool).await? as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Live FIFO snapshot, updated after each mutation made through this store.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingPost>> {
        self.view.subscribe()
    }

    /// Move a post the endpoint will never accept out of the queue.
    pub async fn park(&self, id: i64, reason: &str) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        if db::park_pending(&self.pool, id, reason).await? {
            warn!(id, reason, "post rejected permanently; parked");
            self.refresh_view().await;
        }
        Ok(())
    }

    pub async fn list_failed(&self) -> Result<Vec<FailedPost>> {
        db::list_failed(&self.pool).await
    }

    /// Put a parked post back at the tail of the queue under a fresh id.
    pub async fn requeue_failed(&self, id: i64) -> Result<Option<i64>> {
        let _guard = self.write_guard.lock().await;
        let new_id = db::requeue_failed(&self.pool, id).await?;
        if let Some(new_id) = new_id {
            info!(old_id = id, new_id, "parked post requeued");
            self.refresh_view().await;
        }
        Ok(new_id)
    }

    pub async fn discard_failed(&self, id: i64) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        db::delete_failed(&self.pool, id).await
    }

    async fn refresh_view(&self) {
        match db::list_pending(&self.pool).await {
            Ok(snapshot) => {
                self.view.send_replace(snapshot);
            }
            Err(err) => warn!(?err, "failed to refresh queue view"),
        }
    }
}
