//! Tag-set normalization and set-difference planning.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;

pub const MAX_TAG_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("tag `{name}` is {len} characters, limit is {MAX_TAG_LEN}")]
    TooLong { name: String, len: usize },
}

/// Trim, drop blanks, merge duplicates. Any name over the limit rejects the whole set.
pub fn normalize_tag_names<I, S>(names: I) -> Result<BTreeSet<String>, TagError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = BTreeSet::new();
    for name in names {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        let len = trimmed.chars().count();
        if len > MAX_TAG_LEN {
            return Err(TagError::TooLong {
                name: trimmed.to_string(),
                len,
            });
        }
        out.insert(trimmed.to_string());
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagDiff {
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

pub fn diff_tags(current: &BTreeSet<String>, wanted: &BTreeSet<String>) -> TagDiff {
    TagDiff {
        add: wanted.difference(current).cloned().collect(),
        remove: current.difference(wanted).cloned().collect(),
    }
}
