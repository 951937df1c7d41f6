//! Windows security identifier decoding
//!
//! Active Directory returns `tokenGroups` as binary SIDs:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 1    | revision                                |
//! | 1      | 1    | sub-authority count `n`                 |
//! | 2      | 6    | identifier authority, big-endian        |
//! | 8      | 4·n  | sub-authorities, each little-endian u32 |

use std::fmt;

use crate::error::{DirectoryError, Result};

const HEADER_LEN: usize = 8;

/// A decoded security identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid {
    /// SID revision, always 1 in practice
    pub revision: u8,
    /// 48-bit identifier authority
    pub authority: u64,
    /// Sub-authorities in wire order
    pub sub_authorities: Vec<u32>,
}

impl Sid {
    /// Decode the binary form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(DirectoryError::InvalidInput(format!(
                "SID too short: {} bytes",
                bytes.len()
            )));
        }
        let revision = bytes[0];
        let count = usize::from(bytes[1]);
        let expected = HEADER_LEN + count * 4;
        if bytes.len() < expected {
            return Err(DirectoryError::InvalidInput(format!(
                "SID declares {count} sub-authorities but has {} bytes (need {expected})",
                bytes.len()
            )));
        }

        let authority = bytes[2..HEADER_LEN]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

        let sub_authorities = bytes[HEADER_LEN..expected]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            revision,
            authority,
            sub_authorities,
        })
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-{}", self.revision, self.authority)?;
        for sub in &self.sub_authorities {
            write!(f, "-{sub}")?;
        }
        Ok(())
    }
}

/// Decode a binary SID straight to its `S-R-A-...` string form
pub fn decode_sid(bytes: &[u8]) -> Result<String> {
    Sid::from_bytes(bytes).map(|sid| sid.to_string())
}
