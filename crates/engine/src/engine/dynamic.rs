//! Dynamic roles and leases

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use warden_directory::{DirectoryError, LdifRecord, SecretString, ldif};

use crate::config::MountConfig;
use crate::error::{EngineError, Result};
use crate::model::{DynamicCredentials, DynamicLeaseState, DynamicRole, Lease, TemplateData, validate_name};
use crate::storage::{get_json, keys, put_json};

use super::SecretsEngine;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UsernameData<'a> {
    display_name: &'a str,
    role_name: &'a str,
}

fn probe(role: &str) -> TemplateData {
    TemplateData::new(
        "probe_user".to_string(),
        SecretString::new("probe-password"),
        "probe",
        role,
        Utc::now(),
        Duration::from_secs(3600),
    )
}

fn pick(role: Duration, mount: Duration) -> Duration {
    if role.is_zero() { mount } else { role }
}

impl SecretsEngine {
    fn render_ldif(&self, template: &str, data: &TemplateData) -> Result<Vec<LdifRecord>> {
        let text = self.directory().templates().render(template, data)?;
        Ok(ldif::parse(&text)?)
    }

    fn validate_ldif(&self, field: &str, template: &str, data: &TemplateData) -> Result<()> {
        let records = self
            .render_ldif(template, data)
            .map_err(|e| EngineError::InvalidRequest(format!("{field}: {e}")))?;
        if records.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "{field} must contain at least one LDIF entry"
            )));
        }
        Ok(())
    }

    fn lease_for(&self, role: &DynamicRole, config: &MountConfig) -> Lease {
        Lease {
            ttl: pick(role.default_ttl, config.ttl),
            max_ttl: pick(role.max_ttl, config.max_ttl),
        }
    }

    async fn dynamic_role(&self, name: &str) -> Result<Option<DynamicRole>> {
        Ok(get_json(self.storage(), &keys::key(keys::DYNAMIC_ROLE, name)).await?)
    }

    /// Create or replace a dynamic role
    ///
    /// Every template must render against a synthetic lease, and the
    /// creation and deletion scripts must yield at least one entry.
    pub async fn write_dynamic_role(&self, role: DynamicRole) -> Result<()> {
        validate_name(&role.name)?;
        if role.creation_ldif.trim().is_empty() || role.deletion_ldif.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "creation_ldif and deletion_ldif are required".to_string(),
            ));
        }
        if !role.max_ttl.is_zero() && role.default_ttl > role.max_ttl {
            return Err(EngineError::InvalidRequest(
                "default_ttl must be smaller than or equal to max_ttl".to_string(),
            ));
        }
        let data = probe(&role.name);
        self.directory()
            .templates()
            .render(
                &role.username_template,
                &UsernameData {
                    display_name: &data.display_name,
                    role_name: &role.name,
                },
            )
            .map_err(|e| EngineError::InvalidRequest(format!("username_template: {e}")))?;
        self.validate_ldif("creation_ldif", &role.creation_ldif, &data)?;
        self.validate_ldif("deletion_ldif", &role.deletion_ldif, &data)?;
        if !role.rollback_ldif.trim().is_empty() {
            self.validate_ldif("rollback_ldif", &role.rollback_ldif, &data)?;
        }

        let _lock = self.inner.locks.write(&role.name).await;
        put_json(self.storage(), &keys::key(keys::DYNAMIC_ROLE, &role.name), &role).await?;
        info!(role = %role.name, "dynamic role written");
        Ok(())
    }

    /// Read a dynamic role
    pub async fn read_dynamic_role(&self, name: &str) -> Result<Option<DynamicRole>> {
        validate_name(name)?;
        let _lock = self.inner.locks.read(name).await;
        self.dynamic_role(name).await
    }

    /// List dynamic roles below `prefix`; folders end with `/`
    pub async fn list_dynamic_roles(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .storage()
            .list(&keys::key(keys::DYNAMIC_ROLE, prefix))
            .await?)
    }

    /// Delete a dynamic role; outstanding leases stay revocable
    pub async fn delete_dynamic_role(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _lock = self.inner.locks.write(name).await;
        self.storage()
            .delete(&keys::key(keys::DYNAMIC_ROLE, name))
            .await?;
        info!(role = %name, "dynamic role deleted");
        Ok(())
    }

    /// Create directory entries for a new lease
    ///
    /// When the creation script fails part way the rollback script, if any,
    /// is applied on a best-effort basis.
    pub async fn create_dynamic_credentials(&self, role_name: &str, display_name: &str) -> Result<DynamicCredentials> {
        validate_name(role_name)?;
        let guard = self.config_guard().await?;
        let config = guard.get()?;
        let role = self
            .dynamic_role(role_name)
            .await?
            .ok_or_else(|| EngineError::not_found("dynamic role", role_name))?;
        let lease = self.lease_for(&role, config);

        let username = self.directory().templates().render(
            &role.username_template,
            &UsernameData {
                display_name,
                role_name,
            },
        )?;
        let password = self.generate_password(config).await?;
        let data = TemplateData::new(username, password, display_name, role_name, Utc::now(), lease.ttl);

        let records = self.render_ldif(&role.creation_ldif, &data)?;
        if let Err(cause) = self
            .directory()
            .apply_ldif(&config.directory, &records, false)
            .await
        {
            warn!(role = %role_name, error = %cause, "creation LDIF failed");
            return Err(self.roll_back_creation(config, &role, &data, cause).await);
        }

        let mut distinguished_names: Vec<String> = Vec::new();
        for record in &records {
            if !distinguished_names.iter().any(|dn| dn == record.dn()) {
                distinguished_names.push(record.dn().to_string());
            }
        }
        info!(role = %role_name, username = %data.username, "dynamic credentials created");
        Ok(DynamicCredentials {
            username: data.username.clone(),
            password: data.password.clone(),
            distinguished_names,
            lease,
            state: DynamicLeaseState {
                name: role.name.clone(),
                deletion_ldif: role.deletion_ldif.clone(),
                template_data: data,
            },
        })
    }

    async fn roll_back_creation(
        &self,
        config: &MountConfig,
        role: &DynamicRole,
        data: &TemplateData,
        cause: DirectoryError,
    ) -> EngineError {
        if role.rollback_ldif.trim().is_empty() {
            return cause.into();
        }
        let rollback = match self.render_ldif(&role.rollback_ldif, data) {
            Ok(records) => self
                .directory()
                .apply_ldif(&config.directory, &records, true)
                .await
                .map_err(EngineError::from),
            Err(e) => Err(e),
        };
        match rollback {
            Ok(()) => {
                info!(role = %role.name, "rollback LDIF applied");
                cause.into()
            }
            Err(rollback_error) => EngineError::LeaseRollbackFailed {
                source: cause,
                rollback_error: rollback_error.to_string(),
            },
        }
    }

    /// Renew a dynamic lease with the role's current TTLs
    pub async fn renew_dynamic_lease(&self, state: &DynamicLeaseState) -> Result<Lease> {
        let guard = self.config_guard().await?;
        let role = self
            .dynamic_role(&state.name)
            .await?
            .ok_or_else(|| EngineError::not_found("dynamic role", &state.name))?;
        Ok(self.lease_for(&role, guard.get()?))
    }

    /// Remove a lease's directory entries
    ///
    /// Uses the deletion script captured at issue time; every entry is
    /// attempted even when some fail.
    pub async fn revoke_dynamic_lease(&self, state: &DynamicLeaseState) -> Result<()> {
        let guard = self.config_guard().await?;
        let config = guard.get()?;
        let records = self.render_ldif(&state.deletion_ldif, &state.template_data)?;
        self.directory()
            .apply_ldif(&config.directory, &records, true)
            .await?;
        info!(role = %state.name, username = %state.template_data.username, "dynamic lease revoked");
        Ok(())
    }
}
