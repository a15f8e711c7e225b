use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::{SecureStorage, StorageError};

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// The access/refresh token pair. Present together or not at all.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Keep tokens out of logs
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Persists a `TokenPair` on top of a `SecureStorage` backend without ever
/// leaving exactly one of the two keys behind.
#[derive(Clone)]
pub struct TokenVault {
    storage: Arc<dyn SecureStorage>,
}

impl TokenVault {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self { storage }
    }

    /// Load the persisted pair.
    ///
    /// A half-written pair is treated as no session and purged. Unreadable
    /// storage is purged too (best effort) and the read error returned.
    pub async fn load(&self) -> Result<Option<TokenPair>, StorageError> {
        let read = async {
            let access = self.storage.get(ACCESS_TOKEN_KEY).await?;
            let refresh = self.storage.get(REFRESH_TOKEN_KEY).await?;
            Ok::<_, StorageError>((access, refresh))
        };
        let (access, refresh) = match read.await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Stored tokens are unreadable, discarding them");
                if let Err(clear_err) = self.clear().await {
                    debug!(error = %clear_err, "Could not purge unreadable tokens");
                }
                return Err(e);
            }
        };

        match (access, refresh) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Ok(Some(TokenPair::new(access, refresh)))
            }
            (None, None) => Ok(None),
            _ => {
                warn!("Found incomplete token pair in storage, discarding it");
                self.clear().await?;
                Ok(None)
            }
        }
    }

    /// Persist both tokens. If the second write fails the first is rolled
    /// back before the error is returned.
    pub async fn store_pair(&self, tokens: &TokenPair) -> Result<(), StorageError> {
        // An unreadable previous token can't be restored; don't let it block the write
        let previous_access = match self.storage.get(ACCESS_TOKEN_KEY).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "Could not read previous access token");
                None
            }
        };

        self.storage
            .set(ACCESS_TOKEN_KEY, &tokens.access_token)
            .await?;

        if let Err(e) = self
            .storage
            .set(REFRESH_TOKEN_KEY, &tokens.refresh_token)
            .await
        {
            warn!(error = %e, "Failed to store refresh token, rolling back access token");
            // The old refresh token is still in place, so restoring the old
            // access token keeps the previous pair intact.
            let rollback = match previous_access {
                Some(ref old) => self.storage.set(ACCESS_TOKEN_KEY, old).await,
                None => self.storage.remove(ACCESS_TOKEN_KEY).await,
            };
            if let Err(rollback_err) = rollback {
                warn!(error = %rollback_err, "Rollback failed, clearing all tokens");
                let _ = self.clear().await;
            }
            return Err(e);
        }

        debug!("Token pair persisted");
        Ok(())
    }

    /// Replace only the access token, keeping the stored refresh token.
    pub async fn store_access(&self, access_token: &str) -> Result<(), StorageError> {
        self.storage.set(ACCESS_TOKEN_KEY, access_token).await?;
        debug!("Access token persisted");
        Ok(())
    }

    /// Remove both tokens. Both removals are attempted even if the first fails.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let access = self.storage.remove(ACCESS_TOKEN_KEY).await;
        let refresh = self.storage.remove(REFRESH_TOKEN_KEY).await;
        access?;
        refresh?;
        debug!("Token pair cleared");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
