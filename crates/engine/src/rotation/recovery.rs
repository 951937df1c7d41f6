//! WAL replay at initialisation
//!
//! Rotation WAL entries are matched to their roles and either discarded as
//! stale or attached to the role's queue item with priority `now`, so the
//! first tick replays the stored candidate password. Check-in entries are
//! replayed directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::engine::SecretsEngine;
use crate::error::Result;
use crate::model::CredentialRecord;
use crate::queue::{Item, PriorityQueue};
use crate::storage::wal::{self, WalEntry};
use crate::storage::{keys, list_recursive};

use super::RotationWal;

struct Candidate {
    id: String,
    created_at: DateTime<Utc>,
}

/// A rotation WAL is stale once the role rotated after it was written, or
/// when neither side has ever rotated. A missing timestamp counts as zero.
fn is_stale(role: Option<DateTime<Utc>>, wal: Option<DateTime<Utc>>) -> bool {
    match (role, wal) {
        (None, None) => true,
        (Some(role), Some(wal)) => role > wal,
        (Some(_), None) => true,
        (None, Some(_)) => false,
    }
}

impl SecretsEngine {
    /// Replay or discard WAL entries, then fill `queue`
    pub(crate) async fn recover(&self, queue: &PriorityQueue) -> Result<()> {
        let mut rotations: HashMap<String, Candidate> = HashMap::new();
        let mut check_ins = Vec::new();

        for id in wal::list_wal(self.storage()).await? {
            let Some(entry) = wal::get_wal(self.storage(), &id).await? else {
                continue;
            };
            match entry.kind.as_str() {
                wal::STATIC_ROTATION => {
                    if let Some(role) = self.keep_rotation_wal(&entry).await? {
                        self.keep_newest(&mut rotations, role, &entry).await;
                    }
                }
                wal::CHECK_IN => check_ins.push(entry),
                other => warn!(wal_id = %id, kind = %other, "ignoring WAL entry of unknown kind"),
            }
        }

        let wal_ids = rotations.into_iter().map(|(role, c)| (role, c.id)).collect();
        self.load_queue(queue, &wal_ids).await?;

        for entry in check_ins {
            self.replay_check_in(entry).await;
        }
        Ok(())
    }

    /// Role name a rotation entry should be replayed for, or `None` after
    /// discarding it
    async fn keep_rotation_wal(&self, entry: &WalEntry) -> Result<Option<String>> {
        let Some(payload) = entry.payload::<RotationWal>() else {
            warn!(wal_id = %entry.id, "discarding malformed rotation WAL");
            self.discard_wal(&entry.id).await;
            return Ok(None);
        };
        let Some(role) = self.static_role(&payload.role_name).await? else {
            info!(wal_id = %entry.id, role = %payload.role_name, "discarding WAL for deleted role");
            self.discard_wal(&entry.id).await;
            return Ok(None);
        };
        if is_stale(role.last_vault_rotation, payload.last_vault_rotation)
            || payload.new_password.is_empty()
        {
            if !payload.new_password.is_empty() && role.password == payload.new_password {
                // role write landed but the credential write did not
                let record = CredentialRecord {
                    current_password: role.password.clone(),
                    last_password: Some(role.last_password.clone()),
                };
                self.inner.creds.put_role(&role.name, &record).await?;
            }
            info!(wal_id = %entry.id, role = %payload.role_name, "discarding stale rotation WAL");
            self.discard_wal(&entry.id).await;
            return Ok(None);
        }
        Ok(Some(payload.role_name))
    }

    async fn keep_newest(&self, kept: &mut HashMap<String, Candidate>, role: String, entry: &WalEntry) {
        let candidate = Candidate {
            id: entry.id.clone(),
            created_at: entry.created_at,
        };
        let newer = kept
            .get(&role)
            .is_none_or(|current| candidate.created_at > current.created_at);
        let loser = if newer {
            match kept.insert(role.clone(), candidate) {
                Some(previous) => previous.id,
                None => return,
            }
        } else {
            candidate.id
        };
        info!(wal_id = %loser, role = %role, "discarding superseded rotation WAL");
        self.discard_wal(&loser).await;
    }

    /// Enqueue every static role, WAL-bearing ones due immediately
    pub(crate) async fn load_queue(
        &self,
        queue: &PriorityQueue,
        wal_ids: &HashMap<String, String>,
    ) -> Result<()> {
        let now = Utc::now();
        for name in list_recursive(self.storage(), keys::STATIC_ROLE).await? {
            let Some(role) = self.static_role(&name).await? else {
                continue;
            };
            let item = match wal_ids.get(&name) {
                Some(id) => {
                    info!(role = %name, wal_id = %id, "rotation WAL found, scheduling replay");
                    Item::new(&name, now.timestamp()).with_wal(Some(id.clone()))
                }
                None => Item::new(&name, role.next_rotation(now)),
            };
            queue.push(&item)?;
        }
        Ok(())
    }
}
