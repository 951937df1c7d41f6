//! In-memory directory double
//!
//! [`MockDirectory`] implements [`DirectoryConnector`] over a shared entry
//! table. It understands equality, presence, `&`, `|` and `!` filters, the
//! `<SID=...>` base used by tokenGroups lookups, and the three password
//! schemas. Every call is journaled with a [`tokio::time::Instant`] so tests
//! running on paused time can assert on schedules.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::client::{
    AttributeList, DirectoryConnection, DirectoryConnector, DirectoryEntry, Modification,
    ModifyOp, Scope, SearchRequest,
};
use crate::config::DirectoryConfig;
use crate::error::{DialFailure, DirectoryError, Result};
use crate::escape::unescape_filter;

const RC_CONSTRAINT_VIOLATION: u32 = 19;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_ALREADY_EXISTS: u32 = 68;

/// Operation kinds that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// Simple and unauthenticated binds
    Bind,
    /// Searches
    Search,
    /// Modify requests
    Modify,
    /// Add requests
    Add,
    /// Delete requests
    Delete,
}

/// One journaled call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryCall {
    /// A connection was dialed
    Dial,
    /// Simple bind
    Bind {
        /// Bind DN
        dn: String,
    },
    /// Name-only bind
    UnauthenticatedBind {
        /// Bind DN
        dn: String,
    },
    /// Search
    Search {
        /// Search base
        base: String,
        /// Filter as sent
        filter: String,
    },
    /// Modify
    Modify {
        /// Target DN
        dn: String,
        /// Password carried by the change, if it was a password change
        password: Option<String>,
        /// Whether the directory accepted it
        succeeded: bool,
    },
    /// Add
    Add {
        /// New entry DN
        dn: String,
    },
    /// Delete
    Delete {
        /// Removed entry DN
        dn: String,
    },
    /// Connection closed
    Close,
}

#[derive(Debug)]
struct Failure {
    op: MockOp,
    dn: Option<String>,
    password: Option<String>,
    remaining: usize,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, DirectoryEntry>,
    passwords: HashMap<String, String>,
    journal: Vec<(Instant, DirectoryCall)>,
    failures: Vec<Failure>,
    unreachable: bool,
    modify_delay: Duration,
}

impl State {
    fn take_failure(&mut self, op: MockOp, dn: &str, password: Option<&str>) -> bool {
        let hit = self.failures.iter_mut().find(|f| {
            f.op == op
                && f.remaining > 0
                && f.dn.as_deref().is_none_or(|d| d.eq_ignore_ascii_case(dn))
                && f.password.as_deref().is_none_or(|p| Some(p) == password)
        });
        match hit {
            Some(failure) => {
                failure.remaining -= 1;
                true
            }
            None => false,
        }
    }

    fn record(&mut self, call: DirectoryCall) {
        self.journal.push((Instant::now(), call));
    }
}

/// Shared in-memory directory; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    state: Arc<Mutex<State>>,
}

impl MockDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn with_entry(self, entry: DirectoryEntry) -> Self {
        self.state.lock().entries.insert(key(&entry.dn), entry);
        self
    }

    /// Add a user entry `dn` with `attr=value` and a password
    pub fn with_user(self, dn: &str, attr: &str, value: &str, password: &str) -> Self {
        self.set_password(dn, password);
        self.with_entry(DirectoryEntry::new(dn).with_attr(attr, [value]))
    }

    /// Set a password directly, bypassing the journal
    pub fn set_password(&self, dn: &str, password: &str) {
        self.state
            .lock()
            .passwords
            .insert(key(dn), password.to_string());
    }

    /// Current password of `dn`
    pub fn password_of(&self, dn: &str) -> Option<String> {
        self.state.lock().passwords.get(&key(dn)).cloned()
    }

    /// Entry stored at `dn`
    pub fn entry(&self, dn: &str) -> Option<DirectoryEntry> {
        self.state.lock().entries.get(&key(dn)).cloned()
    }

    /// Make every dial fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Fail the next `times` calls of `op` against `dn` (any DN when `None`)
    pub fn fail(&self, op: MockOp, dn: Option<&str>, times: usize) {
        self.state.lock().failures.push(Failure {
            op,
            dn: dn.map(str::to_string),
            password: None,
            remaining: times,
        });
    }

    /// Fail the next `times` password changes of `dn` to exactly `password`
    pub fn fail_password_change_to(&self, dn: &str, password: &str, times: usize) {
        self.state.lock().failures.push(Failure {
            op: MockOp::Modify,
            dn: Some(dn.to_string()),
            password: Some(password.to_string()),
            remaining: times,
        });
    }

    /// Suspend every modify for `delay` before applying it
    pub fn set_modify_delay(&self, delay: Duration) {
        self.state.lock().modify_delay = delay;
    }

    /// Journal without timestamps
    pub fn calls(&self) -> Vec<DirectoryCall> {
        self.state
            .lock()
            .journal
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Journal with timestamps
    pub fn journal(&self) -> Vec<(Instant, DirectoryCall)> {
        self.state.lock().journal.clone()
    }

    /// Password-change attempts against `dn`, in order, as `(when, password, accepted)`
    pub fn password_changes(&self, dn: &str) -> Vec<(Instant, String, bool)> {
        self.state
            .lock()
            .journal
            .iter()
            .filter_map(|(at, call)| match call {
                DirectoryCall::Modify {
                    dn: target,
                    password: Some(password),
                    succeeded,
                } if target.eq_ignore_ascii_case(dn) => Some((*at, password.clone(), *succeeded)),
                _ => None,
            })
            .collect()
    }

    /// Number of successful password changes against `dn`
    pub fn accepted_password_changes(&self, dn: &str) -> usize {
        self.password_changes(dn)
            .iter()
            .filter(|(_, _, ok)| *ok)
            .count()
    }

    /// A connection that skips the dial journal entry
    pub fn connection(&self) -> MockConnection {
        MockConnection {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl DirectoryConnector for MockDirectory {
    async fn dial(&self, config: &DirectoryConfig) -> Result<Box<dyn DirectoryConnection>> {
        let mut state = self.state.lock();
        if state.unreachable {
            let attempts = crate::url::split_urls(&config.url)
                .map(|url| DialFailure {
                    url: url.to_string(),
                    cause: "connection refused".to_string(),
                })
                .collect();
            return Err(DirectoryError::Unavailable { attempts });
        }
        state.record(DirectoryCall::Dial);
        drop(state);
        Ok(Box::new(self.connection()))
    }
}

/// Connection handed out by [`MockDirectory`]
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<Mutex<State>>,
}

fn key(dn: &str) -> String {
    dn.to_ascii_lowercase()
}

fn rejected(operation: &'static str, code: u32, message: &str) -> DirectoryError {
    DirectoryError::rejected(operation, code, message)
}

fn password_in(changes: &[Modification]) -> Option<String> {
    changes.iter().find_map(|change| {
        let value = change.values.first()?;
        match change.attribute.to_ascii_lowercase().as_str() {
            "userpassword" | "racfpassword" => String::from_utf8(value.clone()).ok(),
            "unicodepwd" => {
                let units: Vec<u16> = value
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&units)
                    .ok()
                    .map(|s| s.trim_matches('"').to_string())
            }
            _ => None,
        }
    })
}

fn apply_change(entry: &mut DirectoryEntry, change: &Modification) {
    let values: Vec<String> = change
        .values
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect();
    let existing = entry
        .attrs
        .keys()
        .find(|k| k.eq_ignore_ascii_case(&change.attribute))
        .cloned()
        .unwrap_or_else(|| change.attribute.clone());
    match change.op {
        ModifyOp::Replace => {
            entry.attrs.insert(existing, values);
        }
        ModifyOp::Add => entry.attrs.entry(existing).or_default().extend(values),
        ModifyOp::Delete if values.is_empty() => {
            entry.attrs.remove(&existing);
        }
        ModifyOp::Delete => {
            if let Some(current) = entry.attrs.get_mut(&existing) {
                current.retain(|v| !values.contains(v));
            }
        }
        ModifyOp::Increment => {}
    }
}

fn in_scope(dn: &str, request: &SearchRequest) -> bool {
    let dn = key(dn);
    let base = key(&request.base);
    match request.scope {
        Scope::Base => dn == base,
        Scope::Subtree => base.is_empty() || dn == base || dn.ends_with(&format!(",{base}")),
        Scope::OneLevel => dn
            .split_once(',')
            .is_some_and(|(_, parent)| parent == base),
    }
}

fn project(entry: &DirectoryEntry, attributes: &[String]) -> DirectoryEntry {
    if attributes.is_empty() {
        return entry.clone();
    }
    let wanted = |name: &str| attributes.iter().any(|a| a.eq_ignore_ascii_case(name));
    DirectoryEntry {
        dn: entry.dn.clone(),
        attrs: entry
            .attrs
            .iter()
            .filter(|(k, _)| wanted(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        bin_attrs: entry
            .bin_attrs
            .iter()
            .filter(|(k, _)| wanted(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

#[async_trait]
impl DirectoryConnection for MockConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(DirectoryCall::Bind { dn: dn.to_string() });
        if state.take_failure(MockOp::Bind, dn, None) {
            return Err(rejected("bind", RC_INVALID_CREDENTIALS, "injected failure"));
        }
        match state.passwords.get(&key(dn)) {
            Some(expected) if expected != password => {
                Err(rejected("bind", RC_INVALID_CREDENTIALS, "invalid credentials"))
            }
            _ => Ok(()),
        }
    }

    async fn unauthenticated_bind(&mut self, dn: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(DirectoryCall::UnauthenticatedBind { dn: dn.to_string() });
        if state.take_failure(MockOp::Bind, dn, None) {
            return Err(rejected("bind", RC_INVALID_CREDENTIALS, "injected failure"));
        }
        Ok(())
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
        let mut state = self.state.lock();
        state.record(DirectoryCall::Search {
            base: request.base.clone(),
            filter: request.filter.clone(),
        });
        if state.take_failure(MockOp::Search, &request.base, None) {
            return Err(rejected("search", RC_CONSTRAINT_VIOLATION, "injected failure"));
        }
        let filter = Filter::parse(&request.filter)?;

        if let Some(sid) = request
            .base
            .strip_prefix("<SID=")
            .and_then(|s| s.strip_suffix('>'))
        {
            return Ok(state
                .entries
                .values()
                .filter(|e| e.values("objectSid").iter().any(|v| v == sid))
                .map(|e| project(e, &request.attributes))
                .take(1)
                .collect());
        }

        if request.scope == Scope::Base && !state.entries.contains_key(&key(&request.base)) {
            return Err(rejected("search", RC_NO_SUCH_OBJECT, "no such object"));
        }

        let limit = usize::try_from(request.size_limit)
            .ok()
            .filter(|&n| n > 0)
            .unwrap_or(usize::MAX);
        Ok(state
            .entries
            .values()
            .filter(|e| in_scope(&e.dn, request) && filter.matches(e))
            .take(limit)
            .map(|e| project(e, &request.attributes))
            .collect())
    }

    async fn search_paged(
        &mut self,
        request: &SearchRequest,
        _page_size: i32,
    ) -> Result<Vec<DirectoryEntry>> {
        self.search(request).await
    }

    async fn modify(&mut self, dn: &str, changes: &[Modification]) -> Result<()> {
        let delay = self.state.lock().modify_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let password = password_in(changes);
        let mut state = self.state.lock();
        let failed = state.take_failure(MockOp::Modify, dn, password.as_deref());
        let exists = state.entries.contains_key(&key(dn));
        state.record(DirectoryCall::Modify {
            dn: dn.to_string(),
            password: password.clone(),
            succeeded: !failed && exists,
        });
        if failed {
            return Err(rejected("modify", RC_CONSTRAINT_VIOLATION, "injected failure"));
        }
        let Some(entry) = state.entries.get_mut(&key(dn)) else {
            return Err(rejected("modify", RC_NO_SUCH_OBJECT, "no such object"));
        };
        for change in changes {
            let is_password = matches!(
                change.attribute.to_ascii_lowercase().as_str(),
                "userpassword" | "unicodepwd" | "racfpassword"
            );
            if !is_password {
                apply_change(entry, change);
            }
        }
        if let Some(password) = password {
            state.passwords.insert(key(dn), password);
        }
        Ok(())
    }

    async fn add(&mut self, dn: &str, attributes: &AttributeList) -> Result<()> {
        let mut state = self.state.lock();
        state.record(DirectoryCall::Add { dn: dn.to_string() });
        if state.take_failure(MockOp::Add, dn, None) {
            return Err(rejected("add", RC_CONSTRAINT_VIOLATION, "injected failure"));
        }
        if state.entries.contains_key(&key(dn)) {
            return Err(rejected("add", RC_ALREADY_EXISTS, "entry already exists"));
        }
        let mut entry = DirectoryEntry::new(dn);
        for (name, values) in attributes {
            for value in values {
                match String::from_utf8(value.clone()) {
                    Ok(text) => entry.attrs.entry(name.clone()).or_default().push(text),
                    Err(_) => entry
                        .bin_attrs
                        .entry(name.clone())
                        .or_default()
                        .push(value.clone()),
                }
            }
        }
        if let Some(password) = password_in(
            &attributes
                .iter()
                .map(|(name, values)| Modification::replace(name, values.clone()))
                .collect::<Vec<_>>(),
        ) {
            state.passwords.insert(key(dn), password);
        }
        state.entries.insert(key(dn), entry);
        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(DirectoryCall::Delete { dn: dn.to_string() });
        if state.take_failure(MockOp::Delete, dn, None) {
            return Err(rejected("delete", RC_CONSTRAINT_VIOLATION, "injected failure"));
        }
        if state.entries.remove(&key(dn)).is_none() {
            return Err(rejected("delete", RC_NO_SUCH_OBJECT, "no such object"));
        }
        state.passwords.remove(&key(dn));
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    async fn close(&mut self) -> Result<()> {
        self.state.lock().record(DirectoryCall::Close);
        Ok(())
    }
}

/// Filter subset understood by the double
#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
}

impl Filter {
    fn parse(text: &str) -> Result<Self> {
        let (filter, rest) = Self::parse_one(text.trim())?;
        if !rest.trim().is_empty() {
            return Err(DirectoryError::InvalidInput(format!(
                "trailing data after filter: '{rest}'"
            )));
        }
        Ok(filter)
    }

    fn parse_one(text: &str) -> Result<(Self, &str)> {
        let body = text.strip_prefix('(').ok_or_else(|| {
            DirectoryError::InvalidInput(format!("filter must start with '(': '{text}'"))
        })?;
        let (filter, rest) = match body.chars().next() {
            Some(op @ ('&' | '|')) => {
                let mut rest = &body[1..];
                let mut parts = Vec::new();
                while rest.starts_with('(') {
                    let (part, after) = Self::parse_one(rest)?;
                    parts.push(part);
                    rest = after;
                }
                let filter = if op == '&' { Self::And(parts) } else { Self::Or(parts) };
                (filter, rest)
            }
            Some('!') => {
                let (inner, rest) = Self::parse_one(&body[1..])?;
                (Self::Not(Box::new(inner)), rest)
            }
            _ => {
                let end = body.find(')').ok_or_else(|| {
                    DirectoryError::InvalidInput(format!("unclosed filter '{text}'"))
                })?;
                let item = &body[..end];
                let (attr, value) = item.split_once('=').ok_or_else(|| {
                    DirectoryError::InvalidInput(format!("unsupported filter item '{item}'"))
                })?;
                let filter = if value == "*" {
                    Self::Present(attr.to_string())
                } else {
                    Self::Equal(attr.to_string(), unescape_filter(value)?)
                };
                (filter, &body[end..])
            }
        };
        let rest = rest
            .strip_prefix(')')
            .ok_or_else(|| DirectoryError::InvalidInput(format!("unbalanced filter '{text}'")))?;
        Ok((filter, rest))
    }

    fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Self::And(parts) => parts.iter().all(|p| p.matches(entry)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(entry)),
            Self::Not(inner) => !inner.matches(entry),
            Self::Present(attr) => {
                attr.eq_ignore_ascii_case("objectClass") || !entry.raw_values(attr).is_empty()
            }
            Self::Equal(attr, value) => entry
                .values(attr)
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value)),
        }
    }
}
