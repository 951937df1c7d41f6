//! High-level directory operations
//!
//! [`Directory`] owns a [`DirectoryConnector`] and implements the policies the
//! engine relies on: the null-bind guard, user DN resolution, filter
//! rendering, group lookup, password changes per [`PasswordSchema`] and LDIF
//! application. Every public operation dials a fresh connection, binds as the
//! configured service account and closes the connection when done.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{DirectoryConnection, DirectoryConnector, Modification, SearchRequest};
use crate::config::{DEFAULT_USER_FILTER, DirectoryConfig, PasswordSchema};
use crate::dn::canonical_group_name;
use crate::error::{DirectoryError, LdifFailure, Result};
use crate::escape::{escape_dn, escape_filter};
use crate::ldif::LdifRecord;
use crate::sid::decode_sid;
use crate::template::{FilterContext, GroupFilterContext, TemplateEngine};

/// LDAP result code for `noSuchObject`
const RC_NO_SUCH_OBJECT: u32 = 32;

/// Size limit for lookups that must match exactly one entry; a second hit
/// means misconfiguration rather than silent truncation.
const UNIQUE_SIZE_LIMIT: i32 = 2;

/// Identity whose password is being changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    /// Known distinguished name
    Dn(String),
    /// Username to be resolved through the user filter
    Username(String),
}

impl UserRef {
    /// Prefer the DN when one is configured
    pub fn from_parts(dn: &str, username: &str) -> Self {
        if dn.is_empty() {
            Self::Username(username.to_string())
        } else {
            Self::Dn(dn.to_string())
        }
    }
}

/// Directory gateway
#[derive(Clone)]
pub struct Directory {
    connector: Arc<dyn DirectoryConnector>,
    templates: TemplateEngine,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").finish_non_exhaustive()
    }
}

impl Directory {
    /// Wrap a connector
    pub fn new(connector: Arc<dyn DirectoryConnector>) -> Self {
        Self {
            connector,
            templates: TemplateEngine::restricted(),
        }
    }

    /// Template engine shared with callers that render LDIF
    pub fn templates(&self) -> &TemplateEngine {
        &self.templates
    }

    /// Dial and bind as the configured service account
    pub async fn connect(&self, config: &DirectoryConfig) -> Result<Box<dyn DirectoryConnection>> {
        let mut conn = self.connector.dial(config).await?;
        if let Err(e) = bind(
            conn.as_mut(),
            config,
            &config.binddn,
            config.bindpass.expose_secret(),
        )
        .await
        {
            close_quietly(conn.as_mut()).await;
            return Err(e);
        }
        Ok(conn)
    }

    /// Render the user search filter for `username`
    ///
    /// Both substitutions are filter-escaped. With a UPN domain the attribute
    /// becomes `userPrincipalName` and the value `username@upndomain`.
    pub fn render_user_filter(&self, config: &DirectoryConfig, username: &str) -> Result<String> {
        if username.is_empty() {
            return Err(DirectoryError::InvalidInput("missing username".to_string()));
        }
        let template = if config.userfilter.is_empty() {
            DEFAULT_USER_FILTER
        } else {
            config.userfilter.as_str()
        };
        let context = if config.upndomain.is_empty() {
            FilterContext {
                user_attr: escape_filter(&config.userattr),
                username: escape_filter(username),
            }
        } else {
            FilterContext {
                user_attr: "userPrincipalName".to_string(),
                username: format!("{}@{}", escape_filter(username), config.upndomain),
            }
        };
        self.templates.render(template, &context)
    }

    /// Resolve the DN a user binds as
    ///
    /// 1. `discoverdn`, or both `binddn` and `bindpass` set: bind as the
    ///    service account and search with the user filter; exactly one entry
    ///    must match.
    /// 2. `upndomain` set: `username@upndomain`.
    /// 3. Otherwise `userattr=<escaped username>,userdn`.
    pub async fn resolve_user_dn(
        &self,
        conn: &mut dyn DirectoryConnection,
        config: &DirectoryConfig,
        username: &str,
    ) -> Result<String> {
        if username.is_empty() {
            return Err(DirectoryError::InvalidInput("missing username".to_string()));
        }
        let has_service_account =
            !config.binddn.is_empty() && !config.bindpass.expose_secret().is_empty();
        if config.discoverdn || has_service_account {
            bind(conn, config, &config.binddn, config.bindpass.expose_secret()).await?;
            let filter = self.render_user_filter(config, username)?;
            let request = SearchRequest::subtree(&config.userdn, &filter)
                .with_attributes(["1.1"])
                .with_size_limit(UNIQUE_SIZE_LIMIT);
            let entries = conn.search(&request).await?;
            return match entries.as_slice() {
                [only] => Ok(only.dn.clone()),
                [] => Err(DirectoryError::EntryNotFound {
                    base: config.userdn.clone(),
                    filter,
                }),
                many => Err(DirectoryError::AmbiguousEntry {
                    base: config.userdn.clone(),
                    filter,
                    count: many.len(),
                }),
            };
        }
        if !config.upndomain.is_empty() {
            return Ok(format!("{}@{}", escape_dn(username), config.upndomain));
        }
        Ok(format!(
            "{}={},{}",
            config.userattr,
            escape_dn(username),
            config.userdn
        ))
    }

    /// Group names for a user, canonicalised and deduplicated
    pub async fn groups(
        &self,
        conn: &mut dyn DirectoryConnection,
        config: &DirectoryConfig,
        user_dn: &str,
        username: &str,
    ) -> Result<Vec<String>> {
        if user_dn.is_empty() || username.is_empty() {
            return Err(DirectoryError::InvalidInput(
                "group lookup needs both a user DN and a username".to_string(),
            ));
        }
        let entries = if config.use_token_groups {
            token_group_entries(conn, user_dn).await?
        } else {
            self.filter_group_entries(conn, config, user_dn, username)
                .await?
        };

        let pre111 = config.use_pre111_group_cn_behavior;
        let mut names = BTreeSet::new();
        for entry in &entries {
            let values = entry.values(&config.groupattr);
            if values.is_empty() {
                names.insert(canonical_group_name(&entry.dn, pre111));
            } else {
                for value in values {
                    names.insert(canonical_group_name(value, pre111));
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn filter_group_entries(
        &self,
        conn: &mut dyn DirectoryConnection,
        config: &DirectoryConfig,
        user_dn: &str,
        username: &str,
    ) -> Result<Vec<crate::client::DirectoryEntry>> {
        if config.groupfilter.is_empty() || config.groupdn.is_empty() {
            return Ok(Vec::new());
        }
        let context = GroupFilterContext {
            user_dn: escape_filter(user_dn),
            username: escape_filter(username),
        };
        let filter = self.templates.render(&config.groupfilter, &context)?;
        let request =
            SearchRequest::subtree(&config.groupdn, filter).with_attributes([config.groupattr.as_str()]);
        let result = if config.max_page_size > 0 {
            conn.search_paged(&request, config.max_page_size).await
        } else {
            conn.search(&request).await
        };
        match result {
            Ok(entries) => Ok(entries),
            Err(DirectoryError::Rejected {
                code: RC_NO_SUCH_OBJECT,
                message,
                ..
            }) => {
                warn!(base = %config.groupdn, error = %message, "group base does not exist");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a user and return their groups in one round trip
    pub async fn user_groups(&self, config: &DirectoryConfig, username: &str) -> Result<Vec<String>> {
        let mut conn = self.connect(config).await?;
        let result: Result<Vec<String>> = async {
            let user_dn = self.resolve_user_dn(conn.as_mut(), config, username).await?;
            self.groups(conn.as_mut(), config, &user_dn, username).await
        }
        .await;
        close_quietly(conn.as_mut()).await;
        result
    }

    /// Change a user's password using the configured schema
    pub async fn modify_password(
        &self,
        config: &DirectoryConfig,
        user: &UserRef,
        new_password: &str,
    ) -> Result<()> {
        if new_password.is_empty() {
            return Err(DirectoryError::InvalidInput("new password is empty".to_string()));
        }
        let mut conn = self.connect(config).await?;
        let result: Result<()> = async {
            let dn = match user {
                UserRef::Dn(dn) => dn.clone(),
                UserRef::Username(name) => self.resolve_user_dn(conn.as_mut(), config, name).await?,
            };
            conn.modify(&dn, &password_changes(config.schema, new_password))
                .await?;
            debug!(dn = %dn, "password changed");
            Ok(())
        }
        .await;
        close_quietly(conn.as_mut()).await;
        result
    }

    /// Apply parsed LDIF records in order
    ///
    /// Without `continue_on_error` the first failure is returned unchanged.
    /// With it, every record is attempted and the failures are aggregated
    /// into [`DirectoryError::LdifApply`].
    pub async fn apply_ldif(
        &self,
        config: &DirectoryConfig,
        records: &[LdifRecord],
        continue_on_error: bool,
    ) -> Result<()> {
        let mut conn = self.connect(config).await?;
        let mut failures = Vec::new();
        for record in records {
            let outcome = apply_record(conn.as_mut(), record).await;
            match outcome {
                Ok(()) => debug!(dn = %record.dn(), "LDIF record applied"),
                Err(e) if continue_on_error => {
                    warn!(dn = %record.dn(), error = %e, "LDIF record failed, continuing");
                    failures.push(LdifFailure {
                        dn: record.dn().to_string(),
                        cause: e.to_string(),
                    });
                }
                Err(e) => {
                    close_quietly(conn.as_mut()).await;
                    return Err(e);
                }
            }
        }
        close_quietly(conn.as_mut()).await;
        if failures.is_empty() {
            info!(records = records.len(), "LDIF applied");
            Ok(())
        } else {
            Err(DirectoryError::LdifApply { failures })
        }
    }
}

/// Bind, refusing empty passwords when `deny_null_bind` is set
pub async fn bind(
    conn: &mut dyn DirectoryConnection,
    config: &DirectoryConfig,
    dn: &str,
    password: &str,
) -> Result<()> {
    if password.is_empty() {
        if config.deny_null_bind {
            return Err(DirectoryError::NullBind(dn.to_string()));
        }
        return conn.unauthenticated_bind(dn).await;
    }
    conn.bind(dn, password).await
}

/// Modifications that set `password` under `schema`
pub fn password_changes(schema: PasswordSchema, password: &str) -> Vec<Modification> {
    match schema {
        PasswordSchema::OpenLdap => vec![Modification::replace("userPassword", [password])],
        PasswordSchema::Ad => {
            let quoted = format!("\"{password}\"");
            let encoded: Vec<u8> = quoted.encode_utf16().flat_map(u16::to_le_bytes).collect();
            vec![Modification::replace("unicodePwd", [encoded])]
        }
        PasswordSchema::Racf => vec![
            Modification::replace("racfPassword", [password]),
            Modification::replace("racfAttributes", ["noexpired"]),
        ],
    }
}

async fn token_group_entries(
    conn: &mut dyn DirectoryConnection,
    user_dn: &str,
) -> Result<Vec<crate::client::DirectoryEntry>> {
    let request = SearchRequest::base_object(user_dn).with_attributes(["tokenGroups"]);
    let users = conn.search(&request).await?;
    let Some(user) = users.first() else {
        warn!(user_dn = %user_dn, "unable to read user entry for tokenGroups");
        return Ok(Vec::new());
    };

    let mut groups = Vec::new();
    for raw in user.raw_values("tokenGroups") {
        let sid = match decode_sid(&raw) {
            Ok(sid) => sid,
            Err(e) => {
                warn!(user_dn = %user_dn, error = %e, "unreadable SID in tokenGroups");
                continue;
            }
        };
        let lookup = SearchRequest::base_object(format!("<SID={sid}>")).with_attributes(["1.1"]);
        match conn.search(&lookup).await {
            Ok(mut found) if !found.is_empty() => groups.push(found.swap_remove(0)),
            Ok(_) => warn!(sid = %sid, "no entry for group SID"),
            Err(e) => warn!(sid = %sid, error = %e, "group SID lookup failed"),
        }
    }
    Ok(groups)
}

async fn apply_record(conn: &mut dyn DirectoryConnection, record: &LdifRecord) -> Result<()> {
    match record {
        LdifRecord::Add { dn, attributes } | LdifRecord::Entry { dn, attributes } => {
            conn.add(dn, attributes).await
        }
        LdifRecord::Modify { dn, changes } => conn.modify(dn, changes).await,
        LdifRecord::Delete { dn } => conn.delete(dn).await,
    }
}

async fn close_quietly(conn: &mut dyn DirectoryConnection) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "closing directory connection failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ModifyOp;
    use crate::secret::SecretString;
    use crate::testing::{DirectoryCall, MockDirectory};
    use pretty_assertions::assert_eq;

    fn config() -> DirectoryConfig {
        DirectoryConfig {
            url: "ldap://mock".to_string(),
            binddn: "cn=admin,dc=example,dc=com".to_string(),
            bindpass: SecretString::new("admin-pass"),
            userdn: "ou=users,dc=example,dc=com".to_string(),
            userattr: "uid".to_string(),
            ..DirectoryConfig::default()
        }
    }

    fn gateway(mock: &MockDirectory) -> Directory {
        Directory::new(Arc::new(mock.clone()))
    }

    #[tokio::test]
    async fn null_bind_is_refused_before_sending() {
        let mock = MockDirectory::new();
        let cfg = DirectoryConfig {
            bindpass: SecretString::default(),
            ..config()
        };
        let err = gateway(&mock).connect(&cfg).await.err().map(|e| e.to_string());
        assert!(err.unwrap_or_default().contains("empty password"));
        assert!(mock.calls().iter().all(|c| !matches!(c, DirectoryCall::Bind { .. })));
    }

    #[tokio::test]
    async fn unauthenticated_bind_when_allowed() {
        let mock = MockDirectory::new();
        let cfg = DirectoryConfig {
            bindpass: SecretString::default(),
            deny_null_bind: false,
            ..config()
        };
        gateway(&mock).connect(&cfg).await.unwrap();
        assert!(
            mock.calls()
                .iter()
                .any(|c| matches!(c, DirectoryCall::UnauthenticatedBind { .. }))
        );
    }

    #[test]
    fn user_filter_escapes_and_honours_upn() {
        let dir = gateway(&MockDirectory::new());
        let filter = dir.render_user_filter(&config(), ")(cn=admin)").unwrap();
        assert_eq!(filter, "(uid=\\29\\28cn=admin\\29)");

        let upn = DirectoryConfig {
            upndomain: "corp.example".to_string(),
            ..config()
        };
        assert_eq!(
            dir.render_user_filter(&upn, "alice").unwrap(),
            "(userPrincipalName=alice@corp.example)"
        );
    }

    #[tokio::test]
    async fn resolve_requires_exactly_one_entry() {
        let mock = MockDirectory::new()
            .with_user("uid=alice,ou=users,dc=example,dc=com", "uid", "alice", "pw")
            .with_user("uid=bob,ou=a,ou=users,dc=example,dc=com", "uid", "bob", "pw")
            .with_user("uid=bob,ou=b,ou=users,dc=example,dc=com", "uid", "bob", "pw");
        let dir = gateway(&mock);
        let cfg = config();
        let mut conn = dir.connect(&cfg).await.unwrap();

        let dn = dir.resolve_user_dn(conn.as_mut(), &cfg, "alice").await.unwrap();
        assert_eq!(dn, "uid=alice,ou=users,dc=example,dc=com");

        let ambiguous = dir.resolve_user_dn(conn.as_mut(), &cfg, "bob").await;
        assert!(matches!(ambiguous, Err(DirectoryError::AmbiguousEntry { count: 2, .. })));

        let missing = dir.resolve_user_dn(conn.as_mut(), &cfg, "carol").await;
        assert!(matches!(missing, Err(DirectoryError::EntryNotFound { .. })));
    }

    #[tokio::test]
    async fn resolve_synthesises_without_service_account() {
        let mock = MockDirectory::new();
        let dir = gateway(&mock);
        let mut conn = mock.connection();

        let cfg = DirectoryConfig {
            bindpass: SecretString::default(),
            ..config()
        };
        let dn = dir.resolve_user_dn(&mut conn, &cfg, "a,b").await.unwrap();
        assert_eq!(dn, "uid=a\\,b,ou=users,dc=example,dc=com");

        let upn = DirectoryConfig {
            upndomain: "corp".to_string(),
            ..cfg
        };
        assert_eq!(dir.resolve_user_dn(&mut conn, &upn, "alice").await.unwrap(), "alice@corp");
    }

    #[tokio::test]
    async fn filter_groups_fall_back_to_entry_dn() {
        let mock = MockDirectory::new()
            .with_user("uid=alice,ou=users,dc=example,dc=com", "uid", "alice", "pw")
            .with_entry(
                crate::client::DirectoryEntry::new("cn=admins,ou=groups,dc=example,dc=com")
                    .with_attr("memberUid", ["alice"]),
            )
            .with_entry(
                crate::client::DirectoryEntry::new("cn=ops,ou=groups,dc=example,dc=com")
                    .with_attr("memberUid", ["alice"])
                    .with_attr("cn", ["Operators"]),
            );
        let cfg = DirectoryConfig {
            groupdn: "ou=groups,dc=example,dc=com".to_string(),
            groupfilter: "(memberUid={{.Username}})".to_string(),
            ..config()
        };
        let groups = gateway(&mock).user_groups(&cfg, "alice").await.unwrap();
        assert_eq!(groups, vec!["Operators".to_string(), "admins".to_string()]);
    }

    #[tokio::test]
    async fn token_groups_skip_unreadable_sids() {
        let good = vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00];
        let dangling = vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x21, 0x00, 0x00, 0x00];
        let mock = MockDirectory::new()
            .with_entry(
                crate::client::DirectoryEntry::new("cn=alice,dc=corp")
                    .with_binary_attr("tokenGroups", vec![good, vec![0x01], dangling]),
            )
            .with_entry(crate::client::DirectoryEntry::new("CN=Builtin,dc=corp").with_attr(
                "objectSid",
                ["S-1-5-32"],
            ));
        let cfg = DirectoryConfig {
            use_token_groups: true,
            ..config()
        };
        let dir = gateway(&mock);
        let mut conn = dir.connect(&cfg).await.unwrap();
        let groups = dir
            .groups(conn.as_mut(), &cfg, "cn=alice,dc=corp", "alice")
            .await
            .unwrap();
        assert_eq!(groups, vec!["Builtin".to_string()]);
    }

    #[tokio::test]
    async fn modify_password_per_schema() {
        let mock = MockDirectory::new().with_user("uid=svc,ou=users,dc=example,dc=com", "uid", "svc", "old");
        let dir = gateway(&mock);

        dir.modify_password(&config(), &UserRef::Username("svc".to_string()), "n3w")
            .await
            .unwrap();
        assert_eq!(mock.password_of("uid=svc,ou=users,dc=example,dc=com").as_deref(), Some("n3w"));

        let ad = password_changes(PasswordSchema::Ad, "ab");
        assert_eq!(ad[0].attribute, "unicodePwd");
        assert_eq!(ad[0].values[0], vec![0x22, 0, 0x61, 0, 0x62, 0, 0x22, 0]);

        let racf = password_changes(PasswordSchema::Racf, "pw");
        assert_eq!(racf.len(), 2);
        assert_eq!(racf[1].values[0], b"noexpired".to_vec());
        assert!(racf.iter().all(|m| m.op == ModifyOp::Replace));
    }

    #[tokio::test]
    async fn ldif_stops_or_aggregates() {
        let mock = MockDirectory::new();
        let dir = gateway(&mock);
        let records = crate::ldif::parse(
            "dn: cn=a,ou=tmp\nchangetype: add\ncn: a\n\n\
             dn: cn=missing,ou=tmp\nchangetype: delete\n\n\
             dn: cn=b,ou=tmp\nchangetype: add\ncn: b\n",
        )
        .unwrap();

        let err = dir.apply_ldif(&config(), &records, false).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Rejected { .. }));
        assert!(mock.entry("cn=a,ou=tmp").is_some());
        assert!(mock.entry("cn=b,ou=tmp").is_none());

        let err = dir.apply_ldif(&config(), &records, true).await.unwrap_err();
        match err {
            DirectoryError::LdifApply { failures } => {
                let dns: Vec<_> = failures.iter().map(|f| f.dn.as_str()).collect();
                assert_eq!(dns, vec!["cn=a,ou=tmp", "cn=missing,ou=tmp"]);
            }
            other => panic!("unexpected {other}"),
        }
        assert!(mock.entry("cn=b,ou=tmp").is_some());
    }
}
