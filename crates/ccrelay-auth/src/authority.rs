//! The token authority: hands out a usable access token and performs the
//! lazy refresh when the upstream rejects one.
//!
//! There is deliberately no expiry check on the read path. Expiry clocks
//! drift and the upstream is authoritative; a single forced refresh in
//! response to an upstream 401 is simpler and correct. Concurrent
//! refreshes are tolerated — each caller persists a valid triple and the
//! last writer wins.

use std::path::Path;

use tracing::info;

use crate::oauth::OAuthClient;
use crate::store::{CredentialRecord, CredentialStore};
use crate::{AuthError, Result};

pub struct TokenAuthority {
    store: CredentialStore,
    oauth: OAuthClient,
}

impl TokenAuthority {
    pub fn new(dir: &Path) -> Self {
        Self {
            store: CredentialStore::new(dir),
            oauth: OAuthClient::default(),
        }
    }

    pub fn with_oauth(dir: &Path, oauth: OAuthClient) -> Self {
        Self {
            store: CredentialStore::new(dir),
            oauth,
        }
    }

    /// Whether a credential record exists on disk at all.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.store.load(), Ok(Some(_)))
    }

    /// The stored access token, without any expiry gate. Fails only when
    /// no credential exists on disk.
    pub fn access_token(&self) -> Result<String> {
        match self.store.load()? {
            Some(record) => Ok(record.access),
            None => Err(AuthError::NotAuthenticated),
        }
    }

    /// Forced refresh, triggered by an upstream 401. The new triple is
    /// persisted before the access token is returned to any caller; on
    /// failure the caller surfaces the original 401.
    pub async fn force_refresh(&self) -> Result<String> {
        let record = self.store.load()?.ok_or(AuthError::NotAuthenticated)?;

        info!("upstream rejected access token, refreshing");
        let refreshed = self.oauth.refresh(&record.refresh).await?;
        self.store.save(&refreshed)?;
        Ok(refreshed.access)
    }

    /// Persist a freshly minted triple (login flow).
    pub fn install(&self, record: &CredentialRecord) -> Result<()> {
        self.store.save(record)
    }

    /// Remove the credential (logout flow).
    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }
}
