//! Check-out libraries
//!
//! Each service account in a set has a check-out record. Borrowing flips it
//! to unavailable and records the borrower; returning rotates the password
//! before flipping it back, under the same WAL discipline as static
//! rotation.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use warden_directory::{SecretString, UserRef};

use crate::config::MountConfig;
use crate::error::{EngineError, Owner, Result};
use crate::model::{
    AccountStatus, Borrower, CheckOut, CheckedOutCredentials, CredentialRecord, Lease, LibrarySet,
    validate_name,
};
use crate::storage::wal::{self, WalEntry};
use crate::storage::{get_json, keys, put_json};

use super::SecretsEngine;

/// Payload of a check-in WAL entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInWal {
    /// Set the account belongs to
    pub set_name: String,
    /// Account being returned
    pub service_account_name: String,
    /// Candidate password
    pub new_password: SecretString,
    /// Check-out record the check-in ends; `None` while the account is
    /// first brought under management
    #[serde(default)]
    pub returning: Option<CheckOut>,
}

impl CheckInWal {
    /// Whether this entry finishes the check-out described by `record`
    fn returns(&self, record: Option<&CheckOut>) -> bool {
        self.returning.as_ref() == record && !self.new_password.is_empty()
    }
}

impl SecretsEngine {
    async fn check_out_record(&self, account: &str) -> Result<Option<CheckOut>> {
        Ok(get_json(self.storage(), &keys::key(keys::CHECKOUT, account)).await?)
    }

    async fn put_check_out_record(&self, account: &str, record: &CheckOut) -> Result<()> {
        Ok(put_json(self.storage(), &keys::key(keys::CHECKOUT, account), record).await?)
    }

    /// Check-in WAL entries naming `account`
    async fn check_in_wals(&self, account: &str) -> Result<Vec<(WalEntry, CheckInWal)>> {
        let mut found = Vec::new();
        for id in wal::list_wal(self.storage()).await? {
            let Some(entry) = wal::get_wal(self.storage(), &id).await? else {
                continue;
            };
            if entry.kind != wal::CHECK_IN {
                continue;
            }
            if let Some(payload) = entry.payload::<CheckInWal>()
                && payload.service_account_name == account
            {
                found.push((entry, payload));
            }
        }
        Ok(found)
    }

    /// Candidate password left by an earlier attempt to return `record`
    ///
    /// Entries for `account` written against any other check-out are
    /// deleted, as are all but the newest matching one.
    async fn pending_check_in(
        &self,
        account: &str,
        record: Option<&CheckOut>,
    ) -> Result<Option<(String, SecretString)>> {
        let mut pending: Option<(WalEntry, CheckInWal)> = None;
        for (entry, payload) in self.check_in_wals(account).await? {
            if !payload.returns(record) {
                warn!(
                    account = %account,
                    wal_id = %entry.id,
                    "discarding check-in WAL from an earlier check-out"
                );
                self.discard_wal(&entry.id).await;
                continue;
            }
            let newer = pending
                .as_ref()
                .is_none_or(|(kept, _)| entry.created_at > kept.created_at);
            if newer {
                if let Some((older, _)) = pending.replace((entry, payload)) {
                    self.discard_wal(&older.id).await;
                }
            } else {
                self.discard_wal(&entry.id).await;
            }
        }
        Ok(pending.map(|(entry, payload)| (entry.id, payload.new_password)))
    }

    async fn forget_account(&self, account: &str) -> Result<()> {
        for (entry, _) in self.check_in_wals(account).await? {
            self.discard_wal(&entry.id).await;
        }
        self.storage()
            .delete(&keys::key(keys::CHECKOUT, account))
            .await?;
        self.inner.creds.delete_account(account).await?;
        Ok(())
    }

    async fn forget_accounts<S: AsRef<str>>(&self, accounts: &[S]) -> Result<()> {
        for account in accounts {
            self.forget_account(account.as_ref()).await?;
        }
        Ok(())
    }

    /// Rotate `account` and mark it available
    ///
    /// A candidate password from an unfinished attempt at the same check-in
    /// is reused. The caller holds the set's stripe lock and the
    /// configuration guard.
    async fn check_in_locked(
        &self,
        config: &MountConfig,
        set_name: &str,
        account: &str,
    ) -> Result<()> {
        let record = self.check_out_record(account).await?;
        let pending = self.pending_check_in(account, record.as_ref()).await?;
        let (wal_id, new_password) = match pending {
            Some((id, password)) => {
                debug!(account = %account, wal_id = %id, "reusing check-in candidate");
                (id, password)
            }
            None => {
                let new_password = self.generate_password(config).await?;
                let payload = CheckInWal {
                    set_name: set_name.to_string(),
                    service_account_name: account.to_string(),
                    new_password: new_password.clone(),
                    returning: record,
                };
                let id = wal::put_wal(self.storage(), wal::CHECK_IN, &payload).await?;
                (id, new_password)
            }
        };

        self.directory()
            .modify_password(
                &config.directory,
                &UserRef::Username(account.to_string()),
                new_password.expose_secret(),
            )
            .await?;

        let record = CredentialRecord {
            current_password: new_password,
            last_password: None,
        };
        self.inner.creds.put_account(account, &record).await?;
        self.put_check_out_record(account, &CheckOut::available())
            .await?;
        self.discard_wal(&wal_id).await;
        info!(set = %set_name, account = %account, "service account checked in");
        Ok(())
    }

    /// Replay a check-in interrupted by a crash
    ///
    /// The entry is dropped when the account has left the set or when the
    /// check-out it was returning has already ended.
    pub(crate) async fn replay_check_in(&self, entry: WalEntry) {
        let Some(payload) = entry.payload::<CheckInWal>() else {
            warn!(wal_id = %entry.id, "discarding malformed check-in WAL");
            self.discard_wal(&entry.id).await;
            return;
        };
        let account = &payload.service_account_name;
        let _lock = self.inner.locks.write(&payload.set_name).await;
        // replaying an earlier entry for the account may have removed this one
        if !matches!(wal::get_wal(self.storage(), &entry.id).await, Ok(Some(_))) {
            return;
        }
        let still_managed = matches!(
            self.library(&payload.set_name).await,
            Ok(Some(set)) if set.contains(account)
        );
        if !still_managed {
            info!(wal_id = %entry.id, set = %payload.set_name, "discarding check-in WAL for unmanaged account");
            self.discard_wal(&entry.id).await;
            return;
        }
        let current = match self.check_out_record(account).await {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    wal_id = %entry.id,
                    account = %account,
                    error = %e,
                    "cannot read check-out record; the WAL is kept"
                );
                return;
            }
        };
        if !payload.returns(current.as_ref()) {
            info!(
                wal_id = %entry.id,
                account = %account,
                "discarding check-in WAL for a check-out that already ended"
            );
            self.discard_wal(&entry.id).await;
            return;
        }

        let outcome = match self.config_guard().await {
            Ok(guard) => match guard.get() {
                Ok(config) => {
                    self.check_in_locked(config, &payload.set_name, account)
                        .await
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            warn!(
                wal_id = %entry.id,
                account = %account,
                error = %e,
                "check-in replay failed; the WAL is kept for the next start"
            );
        }
    }

    // ── Set CRUD ──────────────────────────────────────────────────────────

    /// Create a library set; every account gets a fresh password
    pub async fn create_library_set(&self, set: LibrarySet) -> Result<()> {
        set.validate()?;
        let _lock = self.inner.locks.write(&set.name).await;
        let guard = self.config_guard().await?;
        let config = guard.get()?;
        let mut managed = self.inner.managed.lock().await;

        if self.library(&set.name).await?.is_some() {
            return Err(EngineError::InvalidRequest(format!(
                "library set '{}' already exists",
                set.name
            )));
        }
        let owner = Owner::Library(set.name.clone());
        for account in &set.service_account_names {
            managed.ensure_available(account, &owner)?;
        }

        for (done, account) in set.service_account_names.iter().enumerate() {
            if let Err(e) = self.check_in_locked(config, &set.name, account).await {
                warn!(set = %set.name, account = %account, error = %e, "initial check-in failed, undoing set");
                self.forget_accounts(&set.service_account_names[..=done]).await?;
                return Err(e);
            }
        }
        if let Err(e) = put_json(self.storage(), &keys::key(keys::LIBRARY, &set.name), &set).await {
            self.forget_accounts(&set.service_account_names).await?;
            return Err(e.into());
        }
        for account in &set.service_account_names {
            managed.insert(account, owner.clone());
        }
        info!(set = %set.name, accounts = set.service_account_names.len(), "library set created");
        Ok(())
    }

    /// Replace a library set's settings and membership
    ///
    /// Removed accounts must be checked in; added accounts get a fresh
    /// password.
    pub async fn update_library_set(&self, set: LibrarySet) -> Result<()> {
        set.validate()?;
        let _lock = self.inner.locks.write(&set.name).await;
        let guard = self.config_guard().await?;
        let config = guard.get()?;
        let mut managed = self.inner.managed.lock().await;

        let existing = self
            .library(&set.name)
            .await?
            .ok_or_else(|| EngineError::not_found("library set", &set.name))?;
        let owner = Owner::Library(set.name.clone());

        let added: Vec<&String> = set
            .service_account_names
            .iter()
            .filter(|a| !existing.contains(a))
            .collect();
        let removed: Vec<&String> = existing
            .service_account_names
            .iter()
            .filter(|a| !set.contains(a))
            .collect();

        for account in &added {
            managed.ensure_available(account, &owner)?;
        }
        for account in &removed {
            if let Some(record) = self.check_out_record(account).await?
                && !record.is_available
            {
                return Err(EngineError::CheckedOut((*account).clone()));
            }
        }

        for (done, account) in added.iter().enumerate() {
            if let Err(e) = self.check_in_locked(config, &set.name, account).await {
                warn!(
                    set = %set.name,
                    account = %account,
                    error = %e,
                    "check-in of added account failed, undoing update"
                );
                self.forget_accounts(&added[..=done]).await?;
                return Err(e);
            }
        }
        if let Err(e) = put_json(self.storage(), &keys::key(keys::LIBRARY, &set.name), &set).await {
            self.forget_accounts(&added).await?;
            return Err(e.into());
        }
        for account in &added {
            managed.insert(account, owner.clone());
        }
        for account in &removed {
            self.forget_account(account).await?;
            managed.remove(account, &owner);
        }
        info!(set = %set.name, added = added.len(), removed = removed.len(), "library set updated");
        Ok(())
    }

    /// Read a library set
    pub async fn read_library_set(&self, name: &str) -> Result<Option<LibrarySet>> {
        validate_name(name)?;
        let _lock = self.inner.locks.read(name).await;
        self.library(name).await
    }

    /// List library sets below `prefix`; folders end with `/`
    pub async fn list_library_sets(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.storage().list(&keys::key(keys::LIBRARY, prefix)).await?)
    }

    /// Delete a library set; fails while any account is checked out
    pub async fn delete_library_set(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _lock = self.inner.locks.write(name).await;
        let mut managed = self.inner.managed.lock().await;
        let Some(set) = self.library(name).await? else {
            return Ok(());
        };
        for account in &set.service_account_names {
            if let Some(record) = self.check_out_record(account).await?
                && !record.is_available
            {
                return Err(EngineError::CheckedOut(account.clone()));
            }
        }
        let owner = Owner::Library(set.name.clone());
        for account in &set.service_account_names {
            self.forget_account(account).await?;
            managed.remove(account, &owner);
        }
        self.storage().delete(&keys::key(keys::LIBRARY, name)).await?;
        info!(set = %name, "library set deleted");
        Ok(())
    }

    // ── Check-out state machine ────────────────────────────────────────────

    /// Borrow the first available account, in configured order
    ///
    /// `requested_ttl` of zero asks for the set's TTL.
    pub async fn check_out(
        &self,
        set_name: &str,
        borrower: &Borrower,
        requested_ttl: Duration,
    ) -> Result<CheckedOutCredentials> {
        validate_name(set_name)?;
        let _lock = self.inner.locks.write(set_name).await;
        let set = self
            .library(set_name)
            .await?
            .ok_or_else(|| EngineError::not_found("library set", set_name))?;

        for account in &set.service_account_names {
            let Some(record) = self.check_out_record(account).await? else {
                warn!(set = %set_name, account = %account, "service account has no check-out record");
                continue;
            };
            if !record.is_available {
                continue;
            }
            let password = self
                .inner
                .creds
                .account(account)
                .await?
                .ok_or_else(|| EngineError::not_found("service account password", account))?;
            self.put_check_out_record(
                account,
                &CheckOut {
                    is_available: false,
                    borrower_entity_id: borrower.entity_id.clone(),
                    borrower_client_token: borrower.client_token.clone(),
                    checked_out_at: Some(Utc::now()),
                },
            )
            .await?;
            info!(set = %set_name, account = %account, "service account checked out");
            return Ok(CheckedOutCredentials {
                set_name: set_name.to_string(),
                service_account_name: account.clone(),
                password: password.current_password,
                lease: Lease {
                    ttl: set.lease_ttl(requested_ttl),
                    max_ttl: set.max_ttl,
                },
            });
        }

        metrics::counter!("warden_library_check_out_unavailable_total", "set" => set_name.to_string())
            .increment(1);
        warn!(set = %set_name, "no service accounts available for check-out");
        Err(EngineError::NoAccountsAvailable(set_name.to_string()))
    }

    /// Return accounts to the set
    ///
    /// Without `accounts` the single account the caller may return is
    /// picked; more than one candidate is an error. Accounts already
    /// available are skipped. Returns the accounts that were checked in.
    pub async fn check_in(
        &self,
        set_name: &str,
        accounts: Option<Vec<String>>,
        borrower: &Borrower,
    ) -> Result<Vec<String>> {
        self.check_in_as(set_name, accounts, borrower, false).await
    }

    /// Operator check-in that ignores who borrowed the accounts
    pub async fn manage_check_in(&self, set_name: &str, accounts: Option<Vec<String>>) -> Result<Vec<String>> {
        self.check_in_as(set_name, accounts, &Borrower::default(), true)
            .await
    }

    async fn check_in_as(
        &self,
        set_name: &str,
        accounts: Option<Vec<String>>,
        borrower: &Borrower,
        force: bool,
    ) -> Result<Vec<String>> {
        validate_name(set_name)?;
        let _lock = self.inner.locks.write(set_name).await;
        let guard = self.config_guard().await?;
        let config = guard.get()?;
        let set = self
            .library(set_name)
            .await?
            .ok_or_else(|| EngineError::not_found("library set", set_name))?;
        let override_borrower = force || set.disable_check_in_enforcement;

        let mut targets = Vec::new();
        match accounts.filter(|a| !a.is_empty()) {
            Some(requested) => {
                let mut seen = HashSet::new();
                for account in requested {
                    if !set.contains(&account) {
                        return Err(EngineError::InvalidRequest(format!(
                            "'{account}' is not a member of library set '{set_name}'"
                        )));
                    }
                    if !seen.insert(account.clone()) {
                        continue;
                    }
                    let Some(record) = self.check_out_record(&account).await? else {
                        continue;
                    };
                    if record.is_available {
                        continue;
                    }
                    if !override_borrower && !borrower.owns(&record) {
                        return Err(EngineError::CheckInUnauthorized(account));
                    }
                    targets.push(account);
                }
            }
            None => {
                for account in &set.service_account_names {
                    if let Some(record) = self.check_out_record(account).await?
                        && !record.is_available
                        && (override_borrower || borrower.owns(&record))
                    {
                        targets.push(account.clone());
                    }
                }
                if targets.len() > 1 {
                    return Err(EngineError::InvalidRequest(
                        "several service accounts are checked out; name the ones to check in"
                            .to_string(),
                    ));
                }
            }
        }

        for account in &targets {
            self.check_in_locked(config, set_name, account).await?;
        }
        Ok(targets)
    }

    /// Extend a check-out lease with the set's current TTLs
    pub async fn renew_check_out(&self, set_name: &str, account: &str) -> Result<Lease> {
        validate_name(set_name)?;
        let _lock = self.inner.locks.read(set_name).await;
        let set = self
            .library(set_name)
            .await?
            .ok_or_else(|| EngineError::not_found("library set", set_name))?;
        let record = self
            .check_out_record(account)
            .await?
            .ok_or_else(|| EngineError::not_found("service account", account))?;
        if record.is_available {
            return Err(EngineError::AlreadyCheckedIn(account.to_string()));
        }
        Ok(Lease {
            ttl: set.ttl,
            max_ttl: set.max_ttl,
        })
    }

    /// Check an account in because its lease ended
    ///
    /// Revoking an account that is already available, or whose set is gone,
    /// succeeds without doing anything.
    pub async fn revoke_check_out(&self, set_name: &str, account: &str) -> Result<()> {
        validate_name(set_name)?;
        let _lock = self.inner.locks.write(set_name).await;
        if self.library(set_name).await?.is_none() {
            debug!(set = %set_name, account = %account, "set gone, nothing to revoke");
            return Ok(());
        }
        match self.check_out_record(account).await? {
            Some(record) if !record.is_available => {
                let guard = self.config_guard().await?;
                self.check_in_locked(guard.get()?, set_name, account)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Availability of every account in a set
    pub async fn library_status(&self, set_name: &str) -> Result<Vec<AccountStatus>> {
        validate_name(set_name)?;
        let _lock = self.inner.locks.read(set_name).await;
        let set = self
            .library(set_name)
            .await?
            .ok_or_else(|| EngineError::not_found("library set", set_name))?;
        let mut statuses = Vec::with_capacity(set.service_account_names.len());
        for account in set.service_account_names {
            let record = self.check_out_record(&account).await?.unwrap_or_default();
            statuses.push(AccountStatus {
                service_account_name: account,
                available: record.is_available,
                borrower_entity_id: record.borrower_entity_id,
                borrower_client_token: record.borrower_client_token,
            });
        }
        Ok(statuses)
    }
}
