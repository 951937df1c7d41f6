//! Escaping of values substituted into filters and DNs
//!
//! - [`escape_filter`]: RFC 4515 assertion values.
//! - [`escape_dn`]: RFC 4514 attribute values, plus `#` and `=` escaped at
//!   any position for Active Directory.

use crate::error::{DirectoryError, Result};

const DN_SPECIAL: &[u8] = b"\\,+\"<>;=#";

/// Escape a value for use inside an LDAP search filter
///
/// ```
/// use warden_directory::escape::escape_filter;
///
/// assert_eq!(escape_filter(")(cn=admin)"), "\\29\\28cn=admin\\29");
/// ```
pub fn escape_filter(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape_filter`]: decode `\XX` hex pairs
pub fn unescape_filter(value: &str) -> Result<String> {
    decode_escapes(value, false)
}

/// Escape a value for use as a DN attribute value
///
/// ```
/// use warden_directory::escape::escape_dn;
///
/// assert_eq!(escape_dn(" #a=b, "), "\\ \\#a\\=b\\,\\ ");
/// ```
pub fn escape_dn(value: &str) -> String {
    let bytes = value.as_bytes();
    let last = bytes.len().saturating_sub(1);
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len() + 8);
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b' ' if i == 0 || i == last => {
                out.push(b'\\');
                out.push(b);
            }
            0 => out.extend_from_slice(b"\\00"),
            b if DN_SPECIAL.contains(&b) => {
                out.push(b'\\');
                out.push(b);
            }
            b => out.push(b),
        }
    }
    // Only ASCII bytes were inserted next to intact UTF-8 sequences.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Reverse [`escape_dn`]: accepts both `\c` and `\XX` forms
pub fn unescape_dn(value: &str) -> Result<String> {
    decode_escapes(value, true)
}

fn decode_escapes(value: &str, allow_char_escape: bool) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let rest = &bytes[i + 1..];
        if rest.len() >= 2
            && let (Some(hi), Some(lo)) = (hex_val(rest[0]), hex_val(rest[1]))
        {
            out.push(hi << 4 | lo);
            i += 3;
            continue;
        }
        match rest.first() {
            Some(&c) if allow_char_escape => {
                out.push(c);
                i += 2;
            }
            _ => {
                return Err(DirectoryError::InvalidInput(format!(
                    "dangling escape at offset {i} in '{value}'"
                )));
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| DirectoryError::InvalidInput(format!("escaped value '{value}' is not UTF-8")))
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("plain", "plain")]
    #[case(" leading", "\\ leading")]
    #[case("trailing ", "trailing\\ ")]
    #[case("#hash", "\\#hash")]
    #[case("mid#hash", "mid\\#hash")]
    #[case("a=b", "a\\=b")]
    #[case("q\"uote", "q\\\"uote")]
    #[case("a+b,c;d<e>f\\g", "a\\+b\\,c\\;d\\<e\\>f\\\\g")]
    #[case("nul\0byte", "nul\\00byte")]
    #[case("inner space", "inner space")]
    fn dn_escape_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(escape_dn(input), expected);
        assert_eq!(unescape_dn(expected).unwrap(), input);
    }

    #[test]
    fn filter_escape_neutralises_injection() {
        let rendered = format!("(cn={})", escape_filter(")(cn=admin)"));
        assert_eq!(rendered.matches('(').count(), 1);
        assert_eq!(rendered.matches(')').count(), 1);
        assert_eq!(unescape_filter(&escape_filter("a*b\\c\0")).unwrap(), "a*b\\c\0");
    }

    #[test]
    fn unescape_accepts_hex_pairs() {
        assert_eq!(unescape_dn("\\41\\2c").unwrap(), "A,");
        assert!(unescape_filter("broken\\").is_err());
    }

    proptest! {
        #[test]
        fn dn_escape_roundtrips(s in any::<String>()) {
            prop_assert_eq!(unescape_dn(&escape_dn(&s)).unwrap(), s);
        }

        #[test]
        fn filter_escape_roundtrips(s in any::<String>()) {
            let escaped = escape_filter(&s);
            prop_assert!(!escaped.contains('('));
            prop_assert!(!escaped.contains(')'));
            prop_assert!(!escaped.contains('*'));
            prop_assert_eq!(unescape_filter(&escaped).unwrap(), s);
        }
    }
}
