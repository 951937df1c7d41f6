//! Root credential rotation
//!
//! The bind password is changed in the directory first and persisted second.
//! When persisting fails the directory is put back to the old password with
//! a quadratic backoff, since a freshly changed password may not have
//! replicated to every directory server yet.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use warden_directory::{DirectoryConfig, SecretString, UserRef};

use crate::config::RollbackPolicy;
use crate::engine::SecretsEngine;
use crate::error::{EngineError, Result};
use crate::storage::{StorageError, keys, put_json};

impl SecretsEngine {
    /// Rotate the mount's own bind password
    ///
    /// On success the new password is persisted and in effect. If the
    /// directory accepted it but storage did not, the old password is
    /// restored and the storage error returned; if restoring fails too the
    /// result is [`EngineError::RollbackFailed`].
    pub async fn rotate_root(&self) -> Result<()> {
        let new_password = {
            let guard = self.config_guard().await?;
            self.generate_password(guard.get()?).await?
        };

        let mut current = self.inner.config.write().await;
        let Some(config) = current.as_ref() else {
            return Err(EngineError::NotConfigured);
        };
        let Some(_flag) = self.root_rotation_flag() else {
            warn!("root credential rotation already in progress");
            return Err(EngineError::RotationInProgress);
        };
        if config.directory.binddn.is_empty() {
            return Err(EngineError::InvalidConfig(
                "rotating the root credential requires binddn".to_string(),
            ));
        }
        let bind_dn = UserRef::Dn(config.directory.binddn.clone());

        self.directory()
            .modify_password(&config.directory, &bind_dn, new_password.expose_secret())
            .await?;

        let old_password = config.directory.bindpass.clone();
        let mut updated = config.clone();
        updated.directory.bindpass = new_password;
        match put_json(self.storage(), keys::CONFIG, &updated).await {
            Ok(()) => {
                *current = Some(updated);
                info!("root credential rotated");
                Ok(())
            }
            Err(cause) => {
                error!(error = %cause, "persisting rotated root credential failed, rolling back");
                self.roll_back_root(&updated.directory, &bind_dn, &old_password, cause)
                    .await
            }
        }
    }

    async fn roll_back_root(
        &self,
        rotated: &DirectoryConfig,
        bind_dn: &UserRef,
        old_password: &SecretString,
        cause: StorageError,
    ) -> Result<()> {
        let policy: RollbackPolicy = self.inner.settings.rollback;
        let cancel: CancellationToken = self.cancel_token();
        let mut last_error = String::from("no attempt made");

        for attempt in 0..policy.max_attempts {
            let delay = policy.delay(attempt);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(EngineError::RollbackFailed {
                        cause: cause.to_string(),
                        attempts: attempt,
                        last_error: format!("canceled ({last_error})"),
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }

            match self
                .directory()
                .modify_password(rotated, bind_dn, old_password.expose_secret())
                .await
            {
                Ok(()) => {
                    info!(attempt = attempt + 1, "root credential rolled back");
                    return Err(EngineError::Storage(cause));
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "root credential rollback attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        error!(
            attempts = policy.max_attempts,
            last_error = %last_error,
            "root credential rollback failed; the stored bind password no longer works"
        );
        Err(EngineError::RollbackFailed {
            cause: cause.to_string(),
            attempts: policy.max_attempts,
            last_error,
        })
    }
}
