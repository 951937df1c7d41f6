//! LDIF change-script parsing (RFC 2849)
//!
//! Supports content records, `changetype: add`, `changetype: delete` and
//! `changetype: modify`, base64 values (`attr:: ...`), line folding, comments
//! and the optional `version: 1` header. URL values (`attr:< ...`) and
//! `modrdn` are rejected.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::client::{AttributeList, Modification, ModifyOp};
use crate::error::{DirectoryError, Result};

/// One parsed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdifRecord {
    /// `changetype: add`
    Add {
        /// Target DN
        dn: String,
        /// Attributes of the new entry
        attributes: AttributeList,
    },
    /// `changetype: modify`
    Modify {
        /// Target DN
        dn: String,
        /// Changes in script order
        changes: Vec<Modification>,
    },
    /// `changetype: delete`
    Delete {
        /// Target DN
        dn: String,
    },
    /// Content record without a change type; applied as an add
    Entry {
        /// Target DN
        dn: String,
        /// Attributes of the entry
        attributes: AttributeList,
    },
}

impl LdifRecord {
    /// DN the record targets
    pub fn dn(&self) -> &str {
        match self {
            Self::Add { dn, .. }
            | Self::Modify { dn, .. }
            | Self::Delete { dn }
            | Self::Entry { dn, .. } => dn,
        }
    }
}

struct Line {
    name: String,
    value: Vec<u8>,
}

impl Line {
    fn text(&self) -> Result<String> {
        String::from_utf8(self.value.clone())
            .map_err(|_| ldif_error(&format!("value of '{}' is not UTF-8", self.name)))
    }
}

/// Parse an LDIF document into records
pub fn parse(input: &str) -> Result<Vec<LdifRecord>> {
    let mut records = Vec::new();
    for (index, block) in blocks(input).into_iter().enumerate() {
        let mut lines = Vec::with_capacity(block.len());
        for raw in &block {
            lines.push(parse_line(raw)?);
        }
        if index == 0
            && lines
                .first()
                .is_some_and(|l| l.name.eq_ignore_ascii_case("version"))
        {
            lines.remove(0);
            if lines.is_empty() {
                continue;
            }
        }
        records.push(parse_record(lines)?);
    }
    Ok(records)
}

/// Split into records: unfold continuation lines, drop comments, separate on
/// blank lines.
fn blocks(input: &str) -> Vec<Vec<String>> {
    let mut blocks: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut in_comment = false;
    for raw in input.lines() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(cont) = line.strip_prefix(' ') {
            if in_comment {
                continue;
            }
            if let Some(last) = current.last_mut() {
                last.push_str(cont);
                continue;
            }
        }
        in_comment = false;
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with('#') {
            in_comment = true;
            continue;
        }
        current.push(line.to_string());
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn parse_line(raw: &str) -> Result<Line> {
    if raw == "-" {
        return Ok(Line {
            name: "-".to_string(),
            value: Vec::new(),
        });
    }
    let (name, rest) = raw
        .split_once(':')
        .ok_or_else(|| ldif_error(&format!("line '{raw}' has no ':'")))?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(ldif_error(&format!("line '{raw}' has no attribute name")));
    }
    let value = if let Some(encoded) = rest.strip_prefix(':') {
        BASE64
            .decode(encoded.trim())
            .map_err(|e| ldif_error(&format!("invalid base64 for '{name}': {e}")))?
    } else if rest.starts_with('<') {
        return Err(ldif_error(&format!("URL values are not supported ('{name}')")));
    } else {
        rest.trim_start().as_bytes().to_vec()
    };
    Ok(Line { name, value })
}

fn parse_record(lines: Vec<Line>) -> Result<LdifRecord> {
    let mut iter = lines.into_iter().peekable();
    let first = iter
        .next()
        .ok_or_else(|| ldif_error("empty record"))?;
    if !first.name.eq_ignore_ascii_case("dn") {
        return Err(ldif_error(&format!(
            "record must start with 'dn:', found '{}:'",
            first.name
        )));
    }
    let dn = first.text()?;

    while iter
        .peek()
        .is_some_and(|l| l.name.eq_ignore_ascii_case("control"))
    {
        iter.next();
    }

    let changetype = match iter.peek() {
        Some(l) if l.name.eq_ignore_ascii_case("changetype") => {
            let kind = l.text()?.trim().to_ascii_lowercase();
            iter.next();
            Some(kind)
        }
        _ => None,
    };

    match changetype.as_deref() {
        None => Ok(LdifRecord::Entry {
            attributes: collect_attributes(iter)?,
            dn,
        }),
        Some("add") => Ok(LdifRecord::Add {
            attributes: collect_attributes(iter)?,
            dn,
        }),
        Some("delete") => {
            if let Some(extra) = iter.next() {
                return Err(ldif_error(&format!(
                    "delete record for '{dn}' has unexpected line '{}:'",
                    extra.name
                )));
            }
            Ok(LdifRecord::Delete { dn })
        }
        Some("modify") => Ok(LdifRecord::Modify {
            changes: collect_changes(iter, &dn)?,
            dn,
        }),
        Some(other) => Err(ldif_error(&format!(
            "unsupported changetype '{other}' for '{dn}'"
        ))),
    }
}

fn collect_attributes(lines: impl Iterator<Item = Line>) -> Result<AttributeList> {
    let mut attributes: AttributeList = Vec::new();
    for line in lines {
        if line.name == "-" {
            return Err(ldif_error("unexpected '-' outside a modify record"));
        }
        match attributes
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(&line.name))
        {
            Some((_, values)) => values.push(line.value),
            None => attributes.push((line.name, vec![line.value])),
        }
    }
    if attributes.is_empty() {
        return Err(ldif_error("add record has no attributes"));
    }
    Ok(attributes)
}

fn collect_changes(lines: impl Iterator<Item = Line>, dn: &str) -> Result<Vec<Modification>> {
    let mut changes = Vec::new();
    let mut current: Option<Modification> = None;
    for line in lines {
        if line.name == "-" {
            match current.take() {
                Some(change) => changes.push(change),
                None => return Err(ldif_error(&format!("stray '-' in modify of '{dn}'"))),
            }
            continue;
        }
        match current.as_mut() {
            None => {
                let op = match line.name.to_ascii_lowercase().as_str() {
                    "add" => ModifyOp::Add,
                    "delete" => ModifyOp::Delete,
                    "replace" => ModifyOp::Replace,
                    "increment" => ModifyOp::Increment,
                    other => {
                        return Err(ldif_error(&format!(
                            "expected add/delete/replace in modify of '{dn}', found '{other}:'"
                        )));
                    }
                };
                current = Some(Modification {
                    op,
                    attribute: line.text()?.trim().to_string(),
                    values: Vec::new(),
                });
            }
            Some(change) => {
                if !line.name.eq_ignore_ascii_case(&change.attribute) {
                    return Err(ldif_error(&format!(
                        "attribute '{}' does not match '{}' in modify of '{dn}'",
                        line.name, change.attribute
                    )));
                }
                change.values.push(line.value);
            }
        }
    }
    if let Some(change) = current {
        changes.push(change);
    }
    if changes.is_empty() {
        return Err(ldif_error(&format!("modify of '{dn}' has no changes")));
    }
    Ok(changes)
}

fn ldif_error(reason: &str) -> DirectoryError {
    DirectoryError::InvalidInput(format!("LDIF: {reason}"))
}
