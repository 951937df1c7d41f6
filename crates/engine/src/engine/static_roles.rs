//! Static role operations

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use warden_directory::SecretString;

use crate::error::{EngineError, Owner, Result};
use crate::model::{
    MIN_ROTATION_PERIOD, StaticCredentials, StaticRole, StaticRoleRequest, validate_name,
};
use crate::queue::Item;
use crate::rotation::RotationWal;
use crate::storage::{keys, put_json, wal};

use super::SecretsEngine;

fn role_name(name: &str) -> Result<String> {
    let name = name.to_lowercase();
    validate_name(&name)?;
    Ok(name)
}

fn check_period(period: Duration) -> Result<()> {
    if period < MIN_ROTATION_PERIOD {
        return Err(EngineError::InvalidRequest(format!(
            "rotation_period must be at least {}s",
            MIN_ROTATION_PERIOD.as_secs()
        )));
    }
    Ok(())
}

fn without_secrets(mut role: StaticRole) -> StaticRole {
    role.password = SecretString::default();
    role.last_password = SecretString::default();
    role
}

impl SecretsEngine {
    /// Create a static role and take ownership of its directory identity
    ///
    /// Unless import rotation is skipped the password is rotated before the
    /// call returns; if that fails the role is not created.
    pub async fn create_static_role(&self, name: &str, request: StaticRoleRequest) -> Result<StaticRole> {
        let name = role_name(name)?;
        let username = request
            .username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| EngineError::InvalidRequest("username is required".to_string()))?;
        let period = request
            .rotation_period
            .ok_or_else(|| EngineError::InvalidRequest("rotation_period is required".to_string()))?;
        check_period(period)?;
        self.require_queue()?;

        let _lock = self.inner.locks.write(&name).await;
        let guard = self.config_guard().await?;
        let config = guard.get()?;
        let mut managed = self.inner.managed.lock().await;

        if self.static_role(&name).await?.is_some() {
            return Err(EngineError::InvalidRequest(format!(
                "static role '{name}' already exists"
            )));
        }
        let owner = Owner::StaticRole(name.clone());
        managed.ensure_available(&username, &owner)?;

        let mut role = StaticRole {
            name: name.clone(),
            username,
            dn: request.dn.unwrap_or_default(),
            rotation_period: period,
            last_vault_rotation: None,
            password: SecretString::default(),
            last_password: SecretString::default(),
        };
        put_json(self.storage(), &keys::key(keys::STATIC_ROLE, &name), &role).await?;

        let skip = request
            .skip_import_rotation
            .unwrap_or(config.skip_static_role_import_rotation);
        if skip {
            info!(role = %name, "static role imported without rotation");
        } else {
            match self.rotate_locked(config, &name, None).await {
                Ok(rotated) => role = rotated,
                Err(failure) => {
                    warn!(role = %name, error = %failure.error, "initial rotation failed, removing role");
                    self.storage()
                        .delete(&keys::key(keys::STATIC_ROLE, &name))
                        .await?;
                    if let Some(id) = failure.wal_id {
                        self.discard_wal(&id).await;
                    }
                    return Err(failure.error);
                }
            }
        }

        self.reschedule(Item::new(&name, role.next_rotation(Utc::now())));
        managed.insert(&role.username, owner);
        info!(role = %name, username = %role.username, "static role created");
        Ok(without_secrets(role))
    }

    /// Update a static role
    ///
    /// The username cannot change, nor can a DN that was already set. A new
    /// rotation period reschedules the role, keeping any pending WAL id.
    pub async fn update_static_role(&self, name: &str, request: StaticRoleRequest) -> Result<StaticRole> {
        let name = role_name(name)?;
        let _lock = self.inner.locks.write(&name).await;
        let mut role = self
            .static_role(&name)
            .await?
            .ok_or_else(|| EngineError::not_found("static role", &name))?;

        if let Some(username) = &request.username
            && *username != role.username
        {
            return Err(EngineError::InvalidRequest(
                "cannot update static role username".to_string(),
            ));
        }
        if let Some(dn) = request.dn {
            if !role.dn.is_empty() && dn != role.dn {
                return Err(EngineError::InvalidRequest(
                    "cannot update static role distinguished name once set".to_string(),
                ));
            }
            role.dn = dn;
        }
        let period_changed = match request.rotation_period {
            Some(period) if period != role.rotation_period => {
                check_period(period)?;
                role.rotation_period = period;
                true
            }
            _ => false,
        };

        put_json(self.storage(), &keys::key(keys::STATIC_ROLE, &name), &role).await?;

        if period_changed {
            let wal_id = self
                .require_queue()?
                .pop_by_key(&name)
                .and_then(|item| item.value);
            self.reschedule(Item::new(&name, role.next_rotation(Utc::now())).with_wal(wal_id));
        }
        info!(role = %name, "static role updated");
        Ok(without_secrets(role))
    }

    /// Read a static role without its passwords
    pub async fn read_static_role(&self, name: &str) -> Result<Option<StaticRole>> {
        let name = role_name(name)?;
        let _lock = self.inner.locks.read(&name).await;
        Ok(self.static_role(&name).await?.map(without_secrets))
    }

    /// List static roles below `prefix`; folders end with `/`
    pub async fn list_static_roles(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .storage()
            .list(&keys::key(keys::STATIC_ROLE, prefix))
            .await?)
    }

    /// Delete a static role and release its identity
    ///
    /// Deleting a role that does not exist succeeds.
    pub async fn delete_static_role(&self, name: &str) -> Result<()> {
        let name = role_name(name)?;
        let _lock = self.inner.locks.write(&name).await;
        let mut managed = self.inner.managed.lock().await;
        let Some(role) = self.static_role(&name).await? else {
            return Ok(());
        };

        if let Some(queue) = self.queue() {
            queue.pop_by_key(&name);
        }
        self.storage()
            .delete(&keys::key(keys::STATIC_ROLE, &name))
            .await?;
        self.inner.creds.delete_role(&name).await?;
        managed.remove(&role.username, &Owner::StaticRole(name.clone()));
        drop(managed);

        for id in wal::list_wal(self.storage()).await? {
            let Some(entry) = wal::get_wal(self.storage(), &id).await? else {
                continue;
            };
            let references_role = entry.kind == wal::STATIC_ROTATION
                && entry
                    .payload::<RotationWal>()
                    .is_some_and(|p| p.role_name == name);
            if references_role {
                self.discard_wal(&id).await;
            }
        }
        info!(role = %name, "static role deleted");
        Ok(())
    }

    /// Current credentials of a static role
    pub async fn read_static_credentials(&self, name: &str) -> Result<StaticCredentials> {
        let name = role_name(name)?;
        let _lock = self.inner.locks.read(&name).await;
        let role = self
            .static_role(&name)
            .await?
            .ok_or_else(|| EngineError::not_found("static role", &name))?;
        let Some(last_vault_rotation) = role.last_vault_rotation else {
            return Err(EngineError::NotYetRotated(name));
        };
        let record = self.inner.creds.role(&name).await?;
        let (password, last_password) = match record {
            Some(record) => (
                record.current_password,
                record.last_password.unwrap_or_default(),
            ),
            None => (role.password.clone(), role.last_password.clone()),
        };

        let now = Utc::now();
        let due = self
            .queue()
            .and_then(|q| q.get(&name))
            .map_or_else(|| role.next_rotation(now), |item| item.priority);
        let ttl = Duration::from_secs(due.saturating_sub(now.timestamp()).max(0) as u64);

        Ok(StaticCredentials {
            username: role.username,
            dn: role.dn,
            password,
            last_password,
            last_vault_rotation,
            rotation_period: role.rotation_period,
            ttl,
        })
    }

    /// When the queue will next rotate `name`, as unix seconds
    pub fn scheduled_rotation(&self, name: &str) -> Option<i64> {
        self.queue()?.get(&name.to_lowercase()).map(|item| item.priority)
    }

    /// Rotate a static role now
    ///
    /// The swap runs on a detached task and finishes even if the caller
    /// goes away; the role is rescheduled either way.
    pub async fn rotate_role(&self, name: &str) -> Result<()> {
        let name = role_name(name)?;
        if self.static_role(&name).await?.is_none() {
            return Err(EngineError::not_found("static role", &name));
        }
        let queue = self.require_queue()?;
        let wal_id = queue.pop_by_key(&name).and_then(|item| item.value);
        let task = tokio::spawn(self.clone().rotate_and_requeue(name, wal_id));
        task.await
            .map_err(|e| EngineError::Internal(format!("rotation task failed: {e}")))?
    }
}
