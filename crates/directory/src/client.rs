//! Connection traits and request/response types
//!
//! [`DirectoryConnector`] dials a live [`DirectoryConnection`]; the gateway
//! drives everything else through the connection. The production connector
//! lives in [`crate::ldap`]; tests substitute [`crate::testing::MockDirectory`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DirectoryConfig;
use crate::error::Result;

/// Search scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the base entry
    Base,
    /// Direct children of the base
    OneLevel,
    /// The base and everything below it
    Subtree,
}

/// A search against the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base DN
    pub base: String,
    /// Search scope
    pub scope: Scope,
    /// Rendered RFC 4515 filter
    pub filter: String,
    /// Attributes to return; empty means all user attributes
    pub attributes: Vec<String>,
    /// Server-side size limit; 0 means unlimited
    pub size_limit: i32,
}

impl SearchRequest {
    /// Subtree search under `base`
    pub fn subtree(base: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope: Scope::Subtree,
            filter: filter.into(),
            attributes: Vec::new(),
            size_limit: 0,
        }
    }

    /// Read a single entry by DN
    pub fn base_object(dn: impl Into<String>) -> Self {
        Self {
            base: dn.into(),
            scope: Scope::Base,
            filter: "(objectClass=*)".to_string(),
            attributes: Vec::new(),
            size_limit: 1,
        }
    }

    /// Restrict the returned attributes
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the size limit
    pub fn with_size_limit(mut self, limit: i32) -> Self {
        self.size_limit = limit;
        self
    }
}

/// An entry returned by a search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Entry DN
    pub dn: String,
    /// Textual attribute values
    pub attrs: HashMap<String, Vec<String>>,
    /// Values that were not valid UTF-8 (`tokenGroups`, `objectSid`, ...)
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl DirectoryEntry {
    /// New entry with no attributes
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ..Self::default()
        }
    }

    /// Add textual values for `name`
    pub fn with_attr<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs
            .entry(name.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Add binary values for `name`
    pub fn with_binary_attr(mut self, name: &str, values: Vec<Vec<u8>>) -> Self {
        self.bin_attrs.entry(name.to_string()).or_default().extend(values);
        self
    }

    /// Textual values of an attribute, matched case-insensitively
    pub fn values(&self, name: &str) -> &[String] {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or_default()
    }

    /// Raw values of an attribute whether or not they were valid UTF-8
    pub fn raw_values(&self, name: &str) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = self
            .values(name)
            .iter()
            .map(|v| v.as_bytes().to_vec())
            .collect();
        if let Some((_, bin)) = self
            .bin_attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            out.extend(bin.iter().cloned());
        }
        out
    }
}

/// Modify operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOp {
    /// Add values
    Add,
    /// Delete the listed values, or the whole attribute if none are listed
    Delete,
    /// Replace all values
    Replace,
    /// Increment an integer attribute
    Increment,
}

/// One change within a modify request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    /// Operation
    pub op: ModifyOp,
    /// Target attribute
    pub attribute: String,
    /// Operand values
    pub values: Vec<Vec<u8>>,
}

impl Modification {
    /// Replace `attribute` with `values`
    pub fn replace<V: Into<Vec<u8>>>(attribute: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            op: ModifyOp::Replace,
            attribute: attribute.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Attribute list for an add request
pub type AttributeList = Vec<(String, Vec<Vec<u8>>)>;

/// A live, possibly bound connection
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Simple bind
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Bind with a name and no password
    async fn unauthenticated_bind(&mut self, dn: &str) -> Result<()>;

    /// Search and collect every entry
    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>>;

    /// Search using the simple paged results control
    async fn search_paged(
        &mut self,
        request: &SearchRequest,
        page_size: i32,
    ) -> Result<Vec<DirectoryEntry>>;

    /// Apply modifications to one entry
    async fn modify(&mut self, dn: &str, changes: &[Modification]) -> Result<()>;

    /// Create an entry
    async fn add(&mut self, dn: &str, attributes: &AttributeList) -> Result<()>;

    /// Delete an entry
    async fn delete(&mut self, dn: &str) -> Result<()>;

    /// Change the per-request timeout
    fn set_timeout(&mut self, timeout: Duration);

    /// Unbind and drop the transport
    async fn close(&mut self) -> Result<()>;
}

/// Produces connections for a configuration
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Run the dial procedure: try each URL in order, upgrade with StartTLS
    /// when configured, and apply the request timeout.
    async fn dial(&self, config: &DirectoryConfig) -> Result<Box<dyn DirectoryConnection>>;
}
