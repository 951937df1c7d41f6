//! Static rotation
//!
//! The two-phase swap is the only writer of rotation WAL entries:
//!
//! 1. write `{role, new_password}` to the WAL
//! 2. change the password in the directory
//! 3. write the role, then the credential record
//! 4. delete the WAL entry
//!
//! A failure after step 1 leaves the WAL in place and hands its id back, so
//! the retry reuses the same candidate password. The ticker drains due
//! items from the queue and runs each swap on a detached task bounded by
//! `swap_timeout`; a swap that overruns keeps going and requeues itself.

mod recovery;
mod root;

use std::sync::Weak;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_directory::{SecretString, UserRef};

use crate::config::MountConfig;
use crate::engine::{Inner, SecretsEngine};
use crate::error::{EngineError, ErrorKind, Result};
use crate::model::{CredentialRecord, StaticRole};
use crate::queue::Item;
use crate::storage::wal::{self, WalEntry};
use crate::storage::{keys, put_json};

/// Payload of a static rotation WAL entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationWal {
    /// Role being rotated
    pub role_name: String,
    /// Directory identity
    pub username: String,
    /// Distinguished name, if the role has one
    #[serde(default)]
    pub dn: String,
    /// Candidate password
    pub new_password: SecretString,
    /// Role's last rotation when the entry was written
    #[serde(default)]
    pub last_vault_rotation: Option<chrono::DateTime<Utc>>,
}

impl RotationWal {
    /// Decode a static rotation entry for `role`; `None` if it is anything else
    pub fn for_role(entry: &WalEntry, role: &str) -> Option<Self> {
        if entry.kind != wal::STATIC_ROTATION {
            return None;
        }
        entry
            .payload::<Self>()
            .filter(|p| p.role_name == role && !p.new_password.is_empty())
    }
}

/// A failed swap and the WAL entry it left behind
#[derive(Debug)]
pub(crate) struct SwapFailure {
    pub(crate) error: EngineError,
    pub(crate) wal_id: Option<String>,
}

impl SwapFailure {
    fn before_wal(error: impl Into<EngineError>) -> Self {
        Self {
            error: error.into(),
            wal_id: None,
        }
    }

    fn with_wal(error: impl Into<EngineError>, wal_id: &str) -> Self {
        Self {
            error: error.into(),
            wal_id: Some(wal_id.to_string()),
        }
    }
}

impl SecretsEngine {
    /// Two-phase password swap for a static role
    ///
    /// The caller holds the role's stripe lock and the configuration guard.
    pub(crate) async fn rotate_locked(
        &self,
        config: &MountConfig,
        name: &str,
        wal_id: Option<String>,
    ) -> std::result::Result<StaticRole, SwapFailure> {
        let mut role = self
            .static_role(name)
            .await
            .map_err(SwapFailure::before_wal)?
            .ok_or_else(|| SwapFailure::before_wal(EngineError::not_found("static role", name)))?;

        let mut pending = None;
        if let Some(id) = wal_id {
            match wal::get_wal(self.storage(), &id).await {
                Ok(Some(entry)) => match RotationWal::for_role(&entry, name) {
                    Some(payload) => pending = Some((id, payload.new_password)),
                    None => {
                        warn!(role = %name, wal_id = %id, "discarding unusable rotation WAL");
                        self.discard_wal(&id).await;
                    }
                },
                Ok(None) => debug!(role = %name, wal_id = %id, "rotation WAL already gone"),
                Err(e) => return Err(SwapFailure::with_wal(e, &id)),
            }
        }

        let (wal_id, new_password) = match pending {
            Some(found) => found,
            None => {
                let new_password = self
                    .generate_password(config)
                    .await
                    .map_err(SwapFailure::before_wal)?;
                let payload = RotationWal {
                    role_name: name.to_string(),
                    username: role.username.clone(),
                    dn: role.dn.clone(),
                    new_password: new_password.clone(),
                    last_vault_rotation: role.last_vault_rotation,
                };
                let id = wal::put_wal(self.storage(), wal::STATIC_ROTATION, &payload)
                    .await
                    .map_err(SwapFailure::before_wal)?;
                (id, new_password)
            }
        };

        self.directory()
            .modify_password(
                &config.directory,
                &UserRef::from_parts(&role.dn, &role.username),
                new_password.expose_secret(),
            )
            .await
            .map_err(|e| SwapFailure::with_wal(e, &wal_id))?;

        let now = Utc::now();
        role.last_vault_rotation = Some(role.last_vault_rotation.map_or(now, |prev| prev.max(now)));
        role.last_password = std::mem::replace(&mut role.password, new_password.clone());
        put_json(self.storage(), &keys::key(keys::STATIC_ROLE, name), &role)
            .await
            .map_err(|e| {
                error!(role = %name, wal_id = %wal_id, error = %e, "storage write failed after directory change");
                SwapFailure::with_wal(e, &wal_id)
            })?;

        let record = CredentialRecord {
            current_password: new_password,
            last_password: Some(role.last_password.clone()),
        };
        self.inner
            .creds
            .put_role(name, &record)
            .await
            .map_err(|e| {
                error!(role = %name, wal_id = %wal_id, error = %e, "credential write failed after directory change");
                SwapFailure::with_wal(e, &wal_id)
            })?;

        self.discard_wal(&wal_id).await;
        metrics::counter!("warden_static_rotations_total").increment(1);
        info!(role = %name, "static role rotated");
        Ok(role)
    }

    /// Rotate `name` and put it back on the queue
    ///
    /// Success schedules the next period; a missing role is dropped; any
    /// other failure is retried after `retry_delay` with the WAL id kept.
    pub(crate) async fn rotate_and_requeue(self, name: String, wal_id: Option<String>) -> Result<()> {
        let _lock = self.inner.locks.write(&name).await;
        let guard = self.inner.config.read().await;
        let Some(config) = guard.as_ref() else {
            self.reschedule(self.retry_item(&name, wal_id));
            return Err(EngineError::NotConfigured);
        };

        match self.rotate_locked(config, &name, wal_id).await {
            Ok(role) => {
                self.reschedule(Item::new(&name, role.next_rotation(Utc::now())));
                Ok(())
            }
            Err(failure) if failure.error.kind() == ErrorKind::NotFound && failure.wal_id.is_none() => {
                debug!(role = %name, "role vanished before rotation, dropping");
                Err(failure.error)
            }
            Err(failure) => {
                if failure.error.is_retryable() {
                    warn!(
                        role = %name,
                        wal_id = ?failure.wal_id,
                        error = %failure.error,
                        retry_in = ?self.inner.settings.retry_delay,
                        "static rotation failed, requeued"
                    );
                } else {
                    error!(
                        role = %name,
                        wal_id = ?failure.wal_id,
                        error = %failure.error,
                        "static rotation failed and needs attention, requeued"
                    );
                }
                metrics::counter!("warden_static_rotation_failures_total").increment(1);
                self.reschedule(self.retry_item(&name, failure.wal_id));
                Err(failure.error)
            }
        }
    }

    fn retry_item(&self, name: &str, wal_id: Option<String>) -> Item {
        let delay = self.inner.settings.retry_delay.as_secs() as i64;
        Item::new(name, Utc::now().timestamp() + delay).with_wal(wal_id)
    }

    /// Replace whatever is queued for `item.key` with `item`
    ///
    /// Callers hold the stripe lock for the key.
    pub(crate) fn reschedule(&self, item: Item) {
        let Some(queue) = self.queue() else {
            debug!(role = %item.key, "queue torn down, not rescheduling");
            return;
        };
        queue.pop_by_key(&item.key);
        if let Err(e) = queue.push(&item) {
            warn!(role = %item.key, error = %e, "failed to requeue role");
        }
    }

    /// Best-effort WAL removal
    pub(crate) async fn discard_wal(&self, id: &str) {
        if let Err(e) = wal::delete_wal(self.storage(), id).await {
            warn!(wal_id = %id, error = %e, "failed to delete WAL entry");
        }
    }

    /// Run one ticker pass now
    ///
    /// For hosts that drive rotation from their own periodic callback.
    pub async fn run_due_rotations(&self) {
        let cancel = self.cancel_token();
        self.drain_due(&cancel).await;
    }

    /// Pop and rotate every due role
    pub(crate) async fn drain_due(&self, cancel: &CancellationToken) {
        let Some(queue) = self.queue() else {
            return;
        };
        while !cancel.is_cancelled() {
            let Ok(item) = queue.pop() else {
                return;
            };
            match self.static_role(&item.key).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(role = %item.key, "dropping queue item for deleted role");
                    continue;
                }
                Err(e) => {
                    warn!(role = %item.key, error = %e, "cannot read role, retrying next tick");
                    if let Err(e) = queue.push(&item) {
                        debug!(role = %item.key, error = %e, "role was rescheduled concurrently");
                    }
                    return;
                }
            }
            if Utc::now().timestamp() < item.priority {
                if queue.push(&item).is_err() {
                    debug!(role = %item.key, "role was rescheduled concurrently");
                }
                return;
            }

            let task = tokio::spawn(self.clone().rotate_and_requeue(item.key.clone(), item.value.clone()));
            match timeout(self.inner.settings.swap_timeout, task).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(role = %item.key, error = %e, "rotation task aborted");
                    self.reschedule(self.retry_item(&item.key, item.value));
                }
                Err(_) => warn!(
                    role = %item.key,
                    deadline = ?self.inner.settings.swap_timeout,
                    "rotation still running after deadline, continuing in background"
                ),
            }
        }
    }
}

/// Ticker loop; ends when `cancel` fires or the engine is dropped
pub(crate) async fn run_ticker(engine: Weak<Inner>, cancel: CancellationToken) {
    let Some(period) = SecretsEngine::from_weak(&engine).map(|e| e.inner.settings.tick_interval) else {
        return;
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(?period, "rotation ticker started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(engine) = SecretsEngine::from_weak(&engine) else {
                    break;
                };
                engine.drain_due(&cancel).await;
            }
        }
    }
    debug!("rotation ticker stopped");
}
