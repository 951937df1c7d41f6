//! Directory connection configuration
//!
//! [`DirectoryConfig`] is the directory half of the mount configuration
//! record. It is deserialised from the stored JSON, validated once on write
//! with [`DirectoryConfig::validate`], and handed to the connector on every
//! dial.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, Result};
use crate::secret::SecretString;
use crate::template::{FilterContext, GroupFilterContext, TemplateEngine};
use crate::tls;
use crate::url::parse_urls;

/// Default filter used to locate a user entry
pub const DEFAULT_USER_FILTER: &str = "({{.UserAttr}}={{.Username}})";

/// Default filter used to enumerate group memberships
pub const DEFAULT_GROUP_FILTER: &str =
    "(|(memberUid={{.Username}})(member={{.UserDN}})(uniqueMember={{.UserDN}}))";

/// TLS protocol versions accepted by `tls_min_version` / `tls_max_version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.0
    #[serde(rename = "tls10")]
    Tls10,
    /// TLS 1.1
    #[serde(rename = "tls11")]
    Tls11,
    /// TLS 1.2
    #[serde(rename = "tls12")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "tls13")]
    Tls13,
}

impl TlsVersion {
    /// Parse the host's string form (`tls10` .. `tls13`)
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "tls10" => Ok(Self::Tls10),
            "tls11" => Ok(Self::Tls11),
            "tls12" => Ok(Self::Tls12),
            "tls13" => Ok(Self::Tls13),
            other => Err(DirectoryError::InvalidConfig(format!(
                "unknown TLS version '{other}' (expected tls10, tls11, tls12 or tls13)"
            ))),
        }
    }

    /// String form used in configuration
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tls10 => "tls10",
            Self::Tls11 => "tls11",
            Self::Tls12 => "tls12",
            Self::Tls13 => "tls13",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute layout used when changing a password
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordSchema {
    /// Replace `userPassword`
    #[default]
    OpenLdap,
    /// Replace `unicodePwd` with the quoted password in UTF-16LE
    Ad,
    /// Replace `racfPassword` and mark it `noexpired`
    Racf,
}

/// Directory connection and lookup settings
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Comma-separated list of `ldap://` / `ldaps://` URLs, tried left to right
    pub url: String,
    /// Base DN under which users are searched
    pub userdn: String,
    /// Attribute holding the username
    pub userattr: String,
    /// Template used to locate a user entry
    pub userfilter: String,
    /// AD user principal domain; usernames become `user@upndomain`
    pub upndomain: String,
    /// Search for the user DN instead of synthesising it
    pub discoverdn: bool,
    /// Privileged bind identity
    pub binddn: String,
    /// Password for `binddn`
    pub bindpass: SecretString,
    /// Refuse binds with an empty password
    pub deny_null_bind: bool,
    /// Base DN for group searches
    pub groupdn: String,
    /// Template used to enumerate groups
    pub groupfilter: String,
    /// Attribute collected from each group entry
    pub groupattr: String,
    /// Resolve groups through the AD `tokenGroups` attribute
    pub use_token_groups: bool,
    /// Compare names case-sensitively
    pub case_sensitive_names: bool,
    /// Match only upper-case `CN` when canonicalising group names
    pub use_pre111_group_cn_behavior: bool,
    /// PEM-encoded CA bundle
    pub certificate: String,
    /// PEM-encoded client certificate
    pub client_tls_cert: String,
    /// PEM-encoded client private key
    pub client_tls_key: SecretString,
    /// Skip server certificate verification
    pub insecure_tls: bool,
    /// Issue StartTLS on `ldap://` URLs
    pub starttls: bool,
    /// Lowest TLS version offered
    pub tls_min_version: TlsVersion,
    /// Highest TLS version offered
    pub tls_max_version: TlsVersion,
    /// Per-request timeout applied to every operation
    #[serde(with = "crate::duration")]
    pub request_timeout: Duration,
    /// Timeout for establishing a connection
    #[serde(with = "crate::duration")]
    pub connection_timeout: Duration,
    /// Page size for group searches; 0 disables paging
    pub max_page_size: i32,
    /// Password-change attribute layout
    pub schema: PasswordSchema,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "ldap://127.0.0.1".to_string(),
            userdn: String::new(),
            userattr: "cn".to_string(),
            userfilter: DEFAULT_USER_FILTER.to_string(),
            upndomain: String::new(),
            discoverdn: false,
            binddn: String::new(),
            bindpass: SecretString::default(),
            deny_null_bind: true,
            groupdn: String::new(),
            groupfilter: DEFAULT_GROUP_FILTER.to_string(),
            groupattr: "cn".to_string(),
            use_token_groups: false,
            case_sensitive_names: false,
            use_pre111_group_cn_behavior: false,
            certificate: String::new(),
            client_tls_cert: String::new(),
            client_tls_key: SecretString::default(),
            insecure_tls: false,
            starttls: false,
            tls_min_version: TlsVersion::Tls12,
            tls_max_version: TlsVersion::Tls12,
            request_timeout: Duration::from_secs(90),
            connection_timeout: Duration::from_secs(30),
            max_page_size: 0,
            schema: PasswordSchema::OpenLdap,
        }
    }
}

impl fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryConfig")
            .field("url", &self.url)
            .field("userdn", &self.userdn)
            .field("userattr", &self.userattr)
            .field("upndomain", &self.upndomain)
            .field("discoverdn", &self.discoverdn)
            .field("binddn", &self.binddn)
            .field("groupdn", &self.groupdn)
            .field("use_token_groups", &self.use_token_groups)
            .field("starttls", &self.starttls)
            .field("insecure_tls", &self.insecure_tls)
            .field("tls_min_version", &self.tls_min_version)
            .field("tls_max_version", &self.tls_max_version)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl DirectoryConfig {
    /// Validate the record before it is persisted
    ///
    /// Checks, in order: at least one parseable URL, TLS version ordering,
    /// a usable way of locating users, the CA bundle, the client key pair,
    /// and that both filter templates render against a probe payload.
    pub fn validate(&self) -> Result<()> {
        let urls = parse_urls(&self.url);
        if urls.is_empty() {
            return Err(DirectoryError::InvalidConfig(
                "at least one directory URL is required".to_string(),
            ));
        }
        if let Some(bad) = urls.iter().find_map(|u| u.as_ref().err()) {
            return Err(DirectoryError::InvalidConfig(bad.to_string()));
        }

        if self.tls_max_version < self.tls_min_version {
            return Err(DirectoryError::InvalidConfig(format!(
                "tls_max_version ({}) must be greater than or equal to tls_min_version ({})",
                self.tls_max_version, self.tls_min_version
            )));
        }

        if self.binddn.is_empty() && self.upndomain.is_empty() && !self.discoverdn {
            return Err(DirectoryError::InvalidConfig(
                "one of binddn, upndomain or discoverdn must be set".to_string(),
            ));
        }

        if !self.certificate.trim().is_empty() {
            tls::parse_ca_bundle(&self.certificate)
                .map_err(|e| DirectoryError::InvalidConfig(e.to_string()))?;
        }

        let has_cert = !self.client_tls_cert.trim().is_empty();
        let has_key = !self.client_tls_key.expose_secret().trim().is_empty();
        if has_cert != has_key {
            return Err(DirectoryError::InvalidConfig(
                "both client_tls_cert and client_tls_key must be set, or neither".to_string(),
            ));
        }

        let engine = TemplateEngine::restricted();
        engine
            .render(&self.userfilter, &FilterContext::probe())
            .map_err(|e| DirectoryError::InvalidConfig(format!("invalid userfilter: {e}")))?;
        engine
            .render(&self.groupfilter, &GroupFilterContext::probe())
            .map_err(|e| DirectoryError::InvalidConfig(format!("invalid groupfilter: {e}")))?;

        Ok(())
    }

    /// Whether any TLS material or behaviour was configured
    pub fn has_tls_settings(&self) -> bool {
        self.insecure_tls
            || !self.certificate.is_empty()
            || !self.client_tls_cert.is_empty()
            || self.starttls
    }

    /// Copy of this configuration binding with a different password
    pub fn with_bindpass(&self, bindpass: SecretString) -> Self {
        Self {
            bindpass,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> DirectoryConfig {
        DirectoryConfig {
            url: "ldap://dc1.example.com,ldaps://dc2.example.com".to_string(),
            binddn: "cn=admin,dc=example,dc=com".to_string(),
            bindpass: SecretString::new("secret"),
            userdn: "ou=users,dc=example,dc=com".to_string(),
            ..DirectoryConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DirectoryConfig::default();
        assert_eq!(cfg.userattr, "cn");
        assert_eq!(cfg.groupattr, "cn");
        assert!(cfg.deny_null_bind);
        assert_eq!(cfg.tls_min_version, TlsVersion::Tls12);
        assert_eq!(cfg.tls_max_version, TlsVersion::Tls12);
        assert_eq!(cfg.schema, PasswordSchema::OpenLdap);
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn empty_url_rejected() {
        let cfg = DirectoryConfig {
            url: " , ".to_string(),
            ..valid()
        };
        assert!(matches!(cfg.validate(), Err(DirectoryError::InvalidConfig(_))));
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let cfg = DirectoryConfig {
            url: "http://dc1".to_string(),
            ..valid()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("http"), "{err}");
    }

    #[test]
    fn tls_max_below_min_rejected() {
        let cfg = DirectoryConfig {
            tls_min_version: TlsVersion::Tls13,
            tls_max_version: TlsVersion::Tls12,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn needs_a_way_to_locate_users() {
        let cfg = DirectoryConfig {
            binddn: String::new(),
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = DirectoryConfig {
            binddn: String::new(),
            upndomain: "example.com".to_string(),
            ..valid()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn bad_ca_rejected() {
        let cfg = DirectoryConfig {
            certificate: "not a certificate".to_string(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn half_client_pair_rejected() {
        let cfg = DirectoryConfig {
            client_tls_cert: "-----BEGIN CERTIFICATE-----".to_string(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn broken_filter_template_rejected() {
        let cfg = DirectoryConfig {
            userfilter: "({{.UserAttr}}={{.Username}".to_string(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tls_versions_parse() {
        assert_eq!(TlsVersion::parse("tls13").unwrap(), TlsVersion::Tls13);
        assert!(TlsVersion::parse("ssl3").is_err());
        let v: TlsVersion = serde_json::from_str("\"tls11\"").unwrap();
        assert_eq!(v, TlsVersion::Tls11);
        assert!(serde_json::from_str::<TlsVersion>("\"tls14\"").is_err());
    }

    #[test]
    fn debug_does_not_leak_bindpass() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("secret\""));
        assert!(!rendered.contains("bindpass"));
    }

    #[test]
    fn deserialises_with_defaults() {
        let cfg: DirectoryConfig = serde_json::from_str(
            r#"{"url":"ldaps://dc","binddn":"cn=a","bindpass":"p","request_timeout":10}"#,
        )
        .unwrap();
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
        assert_eq!(cfg.userattr, "cn");
        assert_eq!(cfg.bindpass.expose_secret(), "p");
    }
}
