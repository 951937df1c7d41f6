//! Distinguished name parsing and group-name canonicalisation

use crate::error::{DirectoryError, Result};
use crate::escape::unescape_dn;

/// One `type=value` pair of a relative distinguished name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute type as written (`CN`, `cn`, `ou`, ...)
    pub kind: String,
    /// Unescaped attribute value
    pub value: String,
}

/// A relative distinguished name; multi-valued RDNs are joined with `+`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    /// Attributes in the order they appear
    pub attributes: Vec<Attribute>,
}

/// A parsed distinguished name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dn {
    /// RDNs from most specific to least specific
    pub rdns: Vec<Rdn>,
}

impl Dn {
    /// Parse an RFC 4514 string representation
    ///
    /// Both `,` and `;` separate RDNs; `+` separates attributes within an
    /// RDN. Escaped separators inside values are honoured.
    pub fn parse(input: &str) -> Result<Self> {
        let mut rdns = Vec::new();
        for rdn_text in split_unescaped(input, &[b',', b';']) {
            if rdn_text.trim().is_empty() {
                return Err(DirectoryError::InvalidInput(format!(
                    "DN '{input}' has an empty component"
                )));
            }
            let mut attributes = Vec::new();
            for pair in split_unescaped(rdn_text, &[b'+']) {
                attributes.push(parse_pair(pair, input)?);
            }
            rdns.push(Rdn { attributes });
        }
        Ok(Self { rdns })
    }

    /// Iterate every attribute of every RDN in order
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.rdns.iter().flat_map(|rdn| rdn.attributes.iter())
    }
}

fn parse_pair(pair: &str, whole: &str) -> Result<Attribute> {
    let (kind, raw) = pair.split_once('=').ok_or_else(|| {
        DirectoryError::InvalidInput(format!("DN '{whole}': component '{pair}' has no '='"))
    })?;
    let kind = kind.trim();
    if kind.is_empty() {
        return Err(DirectoryError::InvalidInput(format!(
            "DN '{whole}': empty attribute type"
        )));
    }
    let value = unescape_dn(raw.trim_start())?;
    Ok(Attribute {
        kind: kind.to_string(),
        value: trim_unescaped_end(raw, value),
    })
}

/// Trailing spaces are insignificant unless they were escaped
fn trim_unescaped_end(raw: &str, value: String) -> String {
    if raw.ends_with("\\ ") {
        value
    } else {
        value.trim_end().to_string()
    }
}

fn split_unescaped<'a>(input: &'a str, separators: &[u8]) -> Vec<&'a str> {
    let bytes = input.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if separators.contains(&b) => {
                parts.push(&input[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    let tail = &input[start.min(input.len())..];
    if !tail.trim().is_empty() || !parts.is_empty() {
        parts.push(tail);
    }
    parts
}

/// Extract the group name from a DN
///
/// Returns the value of the first `CN` attribute. The attribute type is
/// compared case-insensitively, unless `pre111` is set, in which case only an
/// upper-case `CN` matches. Input that does not parse as a DN, or that has no
/// CN, is returned unchanged.
pub fn canonical_group_name(dn: &str, pre111: bool) -> String {
    let parsed = match Dn::parse(dn) {
        Ok(parsed) if !parsed.rdns.is_empty() => parsed,
        _ => return dn.to_string(),
    };
    parsed
        .attributes()
        .find(|attr| {
            if pre111 {
                attr.kind == "CN"
            } else {
                attr.kind.eq_ignore_ascii_case("cn")
            }
        })
        .map_or_else(|| dn.to_string(), |attr| attr.value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn parses_multi_valued_and_escaped_components() {
        let dn = Dn::parse("cn=Smith\\, John+uid=js, ou=People;dc=example").unwrap();
        assert_eq!(dn.rdns.len(), 3);
        assert_eq!(dn.rdns[0].attributes.len(), 2);
        assert_eq!(dn.rdns[0].attributes[0].value, "Smith, John");
        assert_eq!(dn.rdns[0].attributes[1].kind, "uid");
        assert_eq!(dn.rdns[1].attributes[0].value, "People");
        assert_eq!(dn.rdns[2].attributes[0].kind, "dc");
    }

    #[test]
    fn missing_equals_is_an_error() {
        assert!(Dn::parse("admins").is_err());
        assert!(Dn::parse("cn=a,,dc=b").is_err());
    }

    #[test]
    fn escaped_trailing_space_survives() {
        let dn = Dn::parse("cn=pad\\ ,dc=x").unwrap();
        assert_eq!(dn.rdns[0].attributes[0].value, "pad ");
    }

    #[rstest]
    #[case("cn=admins,ou=groups,dc=example,dc=com", false, "admins")]
    #[case("CN=Domain Admins,CN=Users,DC=corp", false, "Domain Admins")]
    #[case("ou=x,cn=inner,dc=y", false, "inner")]
    #[case("admins", false, "admins")]
    #[case("ou=groups,dc=example", false, "ou=groups,dc=example")]
    #[case("cn=admins,dc=example", true, "cn=admins,dc=example")]
    #[case("CN=admins,dc=example", true, "admins")]
    fn canonicalises_group_names(#[case] dn: &str, #[case] pre111: bool, #[case] expected: &str) {
        assert_eq!(canonical_group_name(dn, pre111), expected);
    }
}
