use crate::model::{FailedPost, PendingPost, PostDraft, RetrySchedule};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

const PENDING_COLUMNS: &str =
    "id, title, content, tags, image_data, image_name, image_path, shortcode_template, enqueued_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus synchronous=FULL: an acknowledged append survives a crash.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL: {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Normalise a file-backed SQLite URL to `sqlite://<path>`, expanding `~/` and
/// creating the parent directory. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let (path, query) = split_sqlite_url(url);
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

fn split_sqlite_url(url: &str) -> (&str, Option<&str>) {
    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    }
}

/// On-disk location of a file-backed SQLite URL, `None` for in-memory databases.
fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let normalized = prepare_sqlite_url(url);
    if !normalized.starts_with("sqlite:") || normalized.starts_with("sqlite::memory") {
        return None;
    }
    let (path, _) = split_sqlite_url(&normalized);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn open(database_url: &str) -> Result<Pool> {
    let pool = init_pool(database_url).await?;
    if let Err(err) = run_migrations(&pool).await {
        pool.close().await;
        return Err(err);
    }
    Ok(pool)
}

fn is_corruption(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err).to_ascii_lowercase();
    text.contains("file is not a database") || text.contains("malformed")
}

/// Open the database and apply migrations. An unreadable file is moved aside to
/// `<file>.corrupt-<unix ts>` and replaced by an empty one.
pub async fn open_or_repair(database_url: &str) -> Result<Pool> {
    let err = match open(database_url).await {
        Ok(pool) => return Ok(pool),
        Err(err) => err,
    };
    let Some(path) = sqlite_file_path(database_url) else {
        return Err(err);
    };
    if !path.exists() || !is_corruption(&err) {
        return Err(err);
    }

    let mut aside = path.clone().into_os_string();
    aside.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let aside = PathBuf::from(aside);
    warn!(
        error = %format!("{:#}", err),
        from = %path.display(),
        to = %aside.display(),
        "queue database unreadable; starting with an empty queue"
    );
    std::fs::rename(&path, &aside)
        .with_context(|| format!("failed to move aside {}", path.display()))?;
    for suffix in ["-wal", "-shm"] {
        let mut side = path.clone().into_os_string();
        side.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(side));
    }
    open(database_url).await
}

fn decode_tags(raw: &str, id: i64) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_else(|err| {
        warn!(id, ?err, "stored tags unreadable; using none");
        Vec::new()
    })
}

/// Decoded row plus, when the stored image could not be read, the reason. Such a
/// row is kept without its image so it can still be listed and parked.
fn draft_from_row(row: &SqliteRow) -> Result<(i64, PostDraft, DateTime<Utc>, Option<String>)> {
    let id: i64 = row.try_get("id")?;
    let title: Option<String> = row.try_get("title")?;
    let tags: String = row.try_get("tags")?;
    let image_data: Option<String> = row.try_get("image_data")?;
    let image_name: Option<String> = row.try_get("image_name")?;
    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;

    let base = PostDraft::new(row.try_get::<String, _>("content")?)
        .with_title(title.unwrap_or_default())
        .with_tags(decode_tags(&tags, id))
        .with_image_path(row.try_get::<String, _>("image_path")?)
        .with_shortcode_template(row.try_get::<String, _>("shortcode_template")?);
    match base.clone().with_image_parts(image_data, image_name) {
        Ok(draft) => Ok((id, draft, enqueued_at, None)),
        Err(err) => {
            warn!(id, ?err, "stored image unreadable");
            Ok((id, base, enqueued_at, Some(format!("stored image unreadable: {}", err))))
        }
    }
}

fn pending_from_row(row: &SqliteRow) -> Result<PendingPost> {
    let (id, post, enqueued_at, unreadable) = draft_from_row(row)?;
    Ok(PendingPost {
        id,
        post,
        enqueued_at,
        unreadable,
    })
}

fn failed_from_row(row: &SqliteRow) -> Result<FailedPost> {
    let (id, post, enqueued_at, _) = draft_from_row(row)?;
    Ok(FailedPost {
        id,
        post,
        enqueued_at,
        reason: row.try_get("reason")?,
        failed_at: row.try_get("failed_at")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_pending(pool: &Pool, post: &PostDraft, enqueued_at: DateTime<Utc>) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = insert_pending_tx(&mut tx, post, enqueued_at).await?;
    tx.commit().await?;
    Ok(id)
}

async fn insert_pending_tx(
    tx: &mut Transaction<'_, Sqlite>,
    post: &PostDraft,
    enqueued_at: DateTime<Utc>,
) -> Result<i64> {
    let tags = serde_json::to_string(post.tags())?;
    let rec = sqlx::query(
        "INSERT INTO pending_posts (title, content, tags, image_data, image_name, image_path, shortcode_template, enqueued_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(post.title())
    .bind(post.content())
    .bind(tags)
    .bind(post.image_data())
    .bind(post.image_name())
    .bind(post.image_path())
    .bind(post.shortcode_template())
    .bind(enqueued_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn oldest_pending(pool: &Pool) -> Result<Option<PendingPost>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM pending_posts ORDER BY id ASC LIMIT 1",
        PENDING_COLUMNS
    ))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(pending_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_pending(pool: &Pool) -> Result<Vec<PendingPost>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM pending_posts ORDER BY id ASC",
        PENDING_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(pending_from_row).collect()
}

pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_posts")
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

/// Returns whether a row was deleted.
#[instrument(skip_all)]
pub async fn delete_pending(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM pending_posts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Move a pending post into `failed_posts` in one transaction.
#[instrument(skip_all)]
pub async fn park_pending(pool: &Pool, id: i64, reason: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let moved = sqlx::query(&format!(
        "INSERT INTO failed_posts ({cols}, reason, failed_at) \
         SELECT {cols}, ?, ? FROM pending_posts WHERE id = ?",
        cols = PENDING_COLUMNS
    ))
    .bind(reason)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    sqlx::query("DELETE FROM pending_posts WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(moved > 0)
}

#[instrument(skip_all)]
pub async fn list_failed(pool: &Pool) -> Result<Vec<FailedPost>> {
    let rows = sqlx::query(&format!(
        "SELECT {}, reason, failed_at FROM failed_posts ORDER BY failed_at ASC, id ASC",
        PENDING_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(failed_from_row).collect()
}

/// Re-append a parked post at the tail of the queue, copying its stored columns
/// unchanged. Returns the new pending id.
#[instrument(skip_all)]
pub async fn requeue_failed(pool: &Pool, id: i64) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    let new_id: Option<i64> = sqlx::query_scalar(
        "INSERT INTO pending_posts (title, content, tags, image_data, image_name, image_path, shortcode_template, enqueued_at) \
         SELECT title, content, tags, image_data, image_name, image_path, shortcode_template, ? \
         FROM failed_posts WHERE id = ? RETURNING id",
    )
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    if new_id.is_some() {
        sqlx::query("DELETE FROM failed_posts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(new_id)
}

#[instrument(skip_all)]
pub async fn delete_failed(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM failed_posts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn load_credential(pool: &Pool) -> Result<Option<(String, bool)>> {
    let row = sqlx::query("SELECT secret, remember FROM credentials WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| (r.get::<String, _>("secret"), r.get::<bool, _>("remember"))))
}

#[instrument(skip_all)]
pub async fn upsert_credential(pool: &Pool, secret: &str, remember: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO credentials (id, secret, remember) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET secret = excluded.secret, remember = excluded.remember",
    )
    .bind(secret)
    .bind(remember)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_credential(pool: &Pool) -> Result<()> {
    sqlx::query("DELETE FROM credentials WHERE id = 1")
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_retry_schedule(pool: &Pool) -> Result<RetrySchedule> {
    let row = sqlx::query("SELECT attempt, next_retry_at FROM sync_state WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(RetrySchedule::default());
    };
    let attempt: i64 = row.try_get("attempt")?;
    Ok(RetrySchedule {
        attempt: u32::try_from(attempt).unwrap_or(0),
        next_retry_at: row.try_get("next_retry_at")?,
    })
}

#[instrument(skip_all)]
pub async fn save_retry_schedule(pool: &Pool, schedule: &RetrySchedule) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_state (id, attempt, next_retry_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET attempt = excluded.attempt, next_retry_at = excluded.next_retry_at",
    )
    .bind(i64::from(schedule.attempt))
    .bind(schedule.next_retry_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_retry_schedule(pool: &Pool) -> Result<()> {
    save_retry_schedule(pool, &RetrySchedule::default()).await
}

/// Claim or extend the lease `name` for `owner` until `now + ttl`. Succeeds when the
/// lease is free, expired, or already held by `owner`; the upsert is a single statement,
/// so two processes can never both win.
#[instrument(skip_all)]
pub async fn claim_lease(
    pool: &Pool,
    name: &str,
    owner: &str,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<bool> {
    let now_ms = now.timestamp_millis();
    let res = sqlx::query(
        "INSERT INTO leases (name, owner, expires_at) VALUES (?, ?, ?) \
         ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at \
         WHERE leases.owner = excluded.owner OR leases.expires_at <= ?",
    )
    .bind(name)
    .bind(owner)
    .bind(now_ms + ttl.num_milliseconds())
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn release_lease(pool: &Pool, name: &str, owner: &str) -> Result<()> {
    sqlx::query("DELETE FROM leases WHERE name = ? AND owner = ?")
        .bind(name)
        .bind(owner)
        .execute(pool)
        .await?;
    Ok(())
}

/// Current unexpired holder of `name`.
pub async fn lease_holder(pool: &Pool, name: &str, now: DateTime<Utc>) -> Result<Option<String>> {
    let owner: Option<String> = sqlx::query_scalar("SELECT owner FROM leases WHERE name = ? AND expires_at > ?")
        .bind(name)
        .bind(now.timestamp_millis())
        .fetch_optional(pool)
        .await?;
    Ok(owner)
}
