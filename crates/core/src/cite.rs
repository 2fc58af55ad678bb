//! Inline citation markers.
//!
//! A marker is a typed token carrying a paper reference number. On the wire
//! it renders as the short textual tag `[n]`; clients own the final
//! presentation, the core never produces HTML.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").unwrap());

/// Citation of the paper with the given reference number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CitationMarker(pub u32);

impl fmt::Display for CitationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// Reference numbers cited in `text`, in first-appearance order, deduplicated.
pub fn extract_markers(text: &str) -> Vec<u32> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cap in MARKER_RE.captures_iter(text) {
        if let Ok(n) = cap[1].parse::<u32>() {
            if seen.insert(n) {
                out.push(n);
            }
        }
    }
    out
}

/// Remove markers whose reference number is not in `allowed`.
///
/// Returns the cleaned text and the reference numbers that were stripped.
pub fn strip_unresolved_markers(text: &str, allowed: &BTreeSet<u32>) -> (String, Vec<u32>) {
    let mut stripped = BTreeSet::new();
    let cleaned = MARKER_RE.replace_all(text, |cap: &regex::Captures<'_>| {
        match cap[1].parse::<u32>() {
            Ok(n) if allowed.contains(&n) => cap[0].to_string(),
            Ok(n) => {
                stripped.insert(n);
                String::new()
            }
            Err(_) => cap[0].to_string(),
        }
    });
    (cleaned.into_owned(), stripped.into_iter().collect())
}
