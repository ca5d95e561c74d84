//! Named leases in the queue database, shared by every process that opens it.
//!
//! A lease is held by one owner until it is released or its expiry passes, so a
//! crashed holder blocks others for at most one TTL.

use crate::db::{self, Pool};
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Held for the duration of one drain pass.
pub const DRAIN: &str = "drain";
/// Held while `quickpost daemon` runs.
pub const DAEMON: &str = "daemon";

pub const DRAIN_TTL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct Lease {
    pool: Pool,
    name: &'static str,
    owner: String,
    ttl: chrono::Duration,
}

impl Lease {
    /// Claim `name`, or `None` when another owner holds it.
    pub async fn acquire(pool: &Pool, name: &'static str, ttl: Duration) -> Result<Option<Self>> {
        let lease = Self {
            pool: pool.clone(),
            name,
            owner: next_owner_id(),
            ttl: chrono::Duration::from_std(ttl)?,
        };
        if lease.renew().await? {
            debug!(lease = name, owner = %lease.owner, "lease acquired");
            Ok(Some(lease))
        } else {
            debug!(lease = name, "lease held elsewhere");
            Ok(None)
        }
    }

    /// Push the expiry out by one TTL. `false` means the lease expired and was taken over.
    pub async fn renew(&self) -> Result<bool> {
        db::claim_lease(&self.pool, self.name, &self.owner, Utc::now(), self.ttl).await
    }

    pub async fn release(self) -> Result<()> {
        db::release_lease(&self.pool, self.name, &self.owner).await?;
        debug!(lease = self.name, owner = %self.owner, "lease released");
        Ok(())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Whether anyone currently holds `name`.
pub async fn is_held(pool: &Pool, name: &str) -> Result<bool> {
    Ok(db::lease_holder(pool, name, Utc::now()).await?.is_some())
}

fn next_owner_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_micros(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn second_claimant_is_refused_until_release() {
        let pool = setup_pool().await;
        let first = Lease::acquire(&pool, DRAIN, DRAIN_TTL).await.unwrap().unwrap();
        assert!(Lease::acquire(&pool, DRAIN, DRAIN_TTL).await.unwrap().is_none());
        assert!(is_held(&pool, DRAIN).await.unwrap());
        // Other names are independent.
        assert!(!is_held(&pool, DAEMON).await.unwrap());

        assert!(first.renew().await.unwrap());
        first.release().await.unwrap();
        assert!(!is_held(&pool, DRAIN).await.unwrap());
        assert!(Lease::acquire(&pool, DRAIN, DRAIN_TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let pool = setup_pool().await;
        let stale = Lease::acquire(&pool, DRAIN, Duration::from_millis(1)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!is_held(&pool, DRAIN).await.unwrap());

        let fresh = Lease::acquire(&pool, DRAIN, DRAIN_TTL).await.unwrap().unwrap();
        assert_ne!(fresh.owner(), stale.owner());
        // The previous owner lost it and cannot renew.
        assert!(!stale.renew().await.unwrap());
        // Releasing a lost lease leaves the new holder alone.
        stale.release().await.unwrap();
        assert!(is_held(&pool, DRAIN).await.unwrap());
    }

    #[tokio::test]
    async fn running_daemon_is_visible_and_exclusive() {
        let pool = setup_pool().await;
        assert!(!is_held(&pool, DAEMON).await.unwrap());

        let daemon = Lease::acquire(&pool, DAEMON, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(is_held(&pool, DAEMON).await.unwrap());
        assert!(Lease::acquire(&pool, DAEMON, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        // A daemon does not block drains.
        assert!(!is_held(&pool, DRAIN).await.unwrap());

        daemon.release().await.unwrap();
        assert!(!is_held(&pool, DAEMON).await.unwrap());
    }
}
