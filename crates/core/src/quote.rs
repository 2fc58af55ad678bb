//! Extracted evidence quotes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::paper::CorpusId;

/// Pointer to one quote: (paper reference number, quote index within paper).
///
/// The wire form is `"<reference>.<index>"`, e.g. `"3.1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuoteHandle {
    pub reference: u32,
    pub index: usize,
}

impl fmt::Display for QuoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.reference, self.index)
    }
}

impl FromStr for QuoteHandle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (r, i) = s
            .split_once('.')
            .ok_or_else(|| format!("malformed quote id: {s:?}"))?;
        Ok(Self {
            reference: r
                .parse()
                .map_err(|_| format!("malformed quote id: {s:?}"))?,
            index: i
                .parse()
                .map_err(|_| format!("malformed quote id: {s:?}"))?,
        })
    }
}

impl Serialize for QuoteHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for QuoteHandle {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// All verbatim quotes extracted from one paper.
///
/// Every quote is a substring of the paper's merged text; the extractor
/// enforces this before the set is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSet {
    pub reference: u32,
    pub corpus_id: CorpusId,
    pub quotes: Vec<String>,
}

impl QuoteSet {
    pub fn handles(&self) -> impl Iterator<Item = QuoteHandle> + '_ {
        let reference = self.reference;
        (0..self.quotes.len()).map(move |index| QuoteHandle { reference, index })
    }

    pub fn get(&self, handle: QuoteHandle) -> Option<&str> {
        if handle.reference != self.reference {
            return None;
        }
        self.quotes.get(handle.index).map(String::as_str)
    }
}
