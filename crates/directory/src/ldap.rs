//! Production connector over `ldap3`

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, SearchEntry, SearchOptions};
use native_tls::TlsConnector;
use tracing::{debug, warn};

use crate::client::{
    AttributeList, DirectoryConnection, DirectoryConnector, DirectoryEntry, Modification,
    ModifyOp, Scope, SearchRequest,
};
use crate::config::DirectoryConfig;
use crate::error::{DialFailure, DirectoryError, Result};
use crate::tls::build_connector;
use crate::url::{DirectoryUrl, Scheme, split_urls};

/// LDAP result code for `sizeLimitExceeded`; the entries received so far are
/// still meaningful to the caller.
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;

/// Dials real directory servers
#[derive(Debug, Clone, Copy, Default)]
pub struct LdapConnector;

impl LdapConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }

    async fn dial_one(
        url: &DirectoryUrl,
        config: &DirectoryConfig,
        tls: Option<&TlsConnector>,
    ) -> Result<Ldap> {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(config.connection_timeout)
            .set_no_tls_verify(config.insecure_tls);
        if url.scheme == Scheme::Ldap && config.starttls {
            settings = settings.set_starttls(true);
        }
        if let Some(connector) = tls {
            settings = settings.set_connector(connector.clone());
        }

        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url.connect_url())
            .await
            .map_err(|e| ldap_error("connect", e))?;
        let target = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(url = %target, error = %e, "directory connection closed with error");
            }
        });
        Ok(ldap)
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn dial(&self, config: &DirectoryConfig) -> Result<Box<dyn DirectoryConnection>> {
        let tls = if config.has_tls_settings() || config.url.contains("ldaps://") {
            Some(build_connector(config)?)
        } else {
            None
        };

        let mut attempts = Vec::new();
        for raw in split_urls(&config.url) {
            let url = match DirectoryUrl::parse(raw) {
                Ok(url) => url,
                Err(e) => {
                    attempts.push(DialFailure {
                        url: raw.to_string(),
                        cause: e.to_string(),
                    });
                    continue;
                }
            };
            debug!(url = %url, "dialing directory");
            match Self::dial_one(&url, config, tls.as_ref()).await {
                Ok(ldap) => {
                    return Ok(Box::new(LdapConnection {
                        ldap,
                        timeout: config.request_timeout,
                    }));
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "dial failed, trying next URL");
                    attempts.push(DialFailure {
                        url: raw.to_string(),
                        cause: e.to_string(),
                    });
                }
            }
        }
        Err(DirectoryError::Unavailable { attempts })
    }
}

/// A connection dialed by [`LdapConnector`]
pub struct LdapConnection {
    ldap: Ldap,
    timeout: Duration,
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn ldap_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

fn ldap_error(operation: &'static str, err: LdapError) -> DirectoryError {
    match err {
        LdapError::LdapResult { result } => DirectoryError::rejected(operation, result.rc, result.text),
        LdapError::Timeout { .. } => DirectoryError::Timeout,
        other => DirectoryError::Connection(format!("{operation}: {other}")),
    }
}

fn to_entry(entry: SearchEntry) -> DirectoryEntry {
    DirectoryEntry {
        dn: entry.dn,
        attrs: entry.attrs,
        bin_attrs: entry.bin_attrs,
    }
}

fn to_mod(change: &Modification) -> Mod<Vec<u8>> {
    let attr = change.attribute.as_bytes().to_vec();
    let values: HashSet<Vec<u8>> = change.values.iter().cloned().collect();
    match change.op {
        ModifyOp::Add => Mod::Add(attr, values),
        ModifyOp::Delete => Mod::Delete(attr, values),
        ModifyOp::Replace => Mod::Replace(attr, values),
        ModifyOp::Increment => {
            let by = change.values.first().cloned().unwrap_or_else(|| b"1".to_vec());
            Mod::Increment(attr, by)
        }
    }
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.ldap
            .with_timeout(self.timeout)
            .simple_bind(dn, password)
            .await
            .and_then(ldap3::LdapResult::success)
            .map(drop)
            .map_err(|e| ldap_error("bind", e))
    }

    async fn unauthenticated_bind(&mut self, dn: &str) -> Result<()> {
        self.bind(dn, "").await
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
        let result = self
            .ldap
            .with_search_options(SearchOptions::new().sizelimit(request.size_limit))
            .with_timeout(self.timeout)
            .search(
                &request.base,
                ldap_scope(request.scope),
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(|e| ldap_error("search", e))?;
        let ldap3::SearchResult(entries, status) = result;
        if status.rc != 0 && status.rc != RC_SIZE_LIMIT_EXCEEDED {
            return Err(DirectoryError::rejected("search", status.rc, status.text));
        }
        Ok(entries
            .into_iter()
            .map(|e| to_entry(SearchEntry::construct(e)))
            .collect())
    }

    async fn search_paged(
        &mut self,
        request: &SearchRequest,
        page_size: i32,
    ) -> Result<Vec<DirectoryEntry>> {
        let adapters: Vec<Box<dyn Adapter<'_, String, Vec<String>>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(page_size)),
        ];
        let mut stream = self
            .ldap
            .with_timeout(self.timeout)
            .streaming_search_with(
                adapters,
                &request.base,
                ldap_scope(request.scope),
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(|e| ldap_error("search", e))?;

        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await.map_err(|e| ldap_error("search", e))? {
            entries.push(to_entry(SearchEntry::construct(entry)));
        }
        stream
            .finish()
            .await
            .success()
            .map_err(|e| ldap_error("search", e))?;
        Ok(entries)
    }

    async fn modify(&mut self, dn: &str, changes: &[Modification]) -> Result<()> {
        let mods: Vec<Mod<Vec<u8>>> = changes.iter().map(to_mod).collect();
        self.ldap
            .with_timeout(self.timeout)
            .modify(dn, mods)
            .await
            .and_then(ldap3::LdapResult::success)
            .map(drop)
            .map_err(|e| ldap_error("modify", e))
    }

    async fn add(&mut self, dn: &str, attributes: &AttributeList) -> Result<()> {
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
            .iter()
            .map(|(name, values)| (name.as_bytes().to_vec(), values.iter().cloned().collect()))
            .collect();
        self.ldap
            .with_timeout(self.timeout)
            .add(dn, attrs)
            .await
            .and_then(ldap3::LdapResult::success)
            .map(drop)
            .map_err(|e| ldap_error("add", e))
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        self.ldap
            .with_timeout(self.timeout)
            .delete(dn)
            .await
            .and_then(ldap3::LdapResult::success)
            .map(drop)
            .map_err(|e| ldap_error("delete", e))
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<()> {
        self.ldap.unbind().await.map_err(|e| ldap_error("unbind", e))
    }
}
