use crate::db::{self, Pool};
use anyhow::Result;
use std::fmt;
use tracing::info;

/// Endpoint password. Never empty; `Debug` does not reveal it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            None
        } else {
            Some(Self(secret))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Secret plus "remember" flag, stored apart from the queue rows.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    pool: Pool,
}

impl CredentialStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn load(&self) -> Result<Option<Credential>> {
        let stored = db::load_credential(&self.pool).await?;
        Ok(stored
            .filter(|(_, remember)| *remember)
            .and_then(|(secret, _)| Credential::new(secret)))
    }

    pub async fn is_remembered(&self) -> Result<bool> {
        Ok(self.load().await?.is_some())
    }

    /// Persist the secret when `remember` is set; otherwise drop whatever was stored.
    pub async fn save(&self, credential: &Credential, remember: bool) -> Result<()> {
        if remember {
            db::upsert_credential(&self.pool, credential.expose(), true).await?;
            info!("credential saved");
        } else {
            self.forget().await?;
        }
        Ok(())
    }

    pub async fn forget(&self) -> Result<()> {
        db::delete_credential(&self.pool).await?;
        info!("credential cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> CredentialStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        CredentialStore::new(pool)
    }

    #[test]
    fn blank_secret_is_rejected() {
        assert!(Credential::new("").is_none());
        assert!(Credential::new("  ").is_none());
        let c = Credential::new("hunter2").unwrap();
        assert_eq!(format!("{:?}", c), "Credential([REDACTED])");
        assert_eq!(c.expose(), "hunter2");
    }

    #[tokio::test]
    async fn remember_flag_controls_persistence() {
        let store = setup_store().await;
        assert!(store.load().await.unwrap().is_none());

        let c = Credential::new("pw").unwrap();
        store.save(&c, true).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(c.clone()));
        assert!(store.is_remembered().await.unwrap());

        store.save(&c, false).await.unwrap();
        assert!(store.load().await.unwrap().is_none());

        store.save(&c, true).await.unwrap();
        store.forget().await.unwrap();
        assert!(!store.is_remembered().await.unwrap());
    }
}
