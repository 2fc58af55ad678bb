//! Comparison tables for list-formatted sections.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::paper::CorpusId;
use crate::quote::QuoteHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    pub corpus_id: CorpusId,
    /// Display label, typically first author + year.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub value: String,
    /// Supporting quote for the value, when the model pointed at one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<QuoteHandle>,
}

impl Cell {
    pub fn not_available() -> Self {
        Self {
            value: "N/A".to_string(),
            evidence: None,
        }
    }
}

/// A filled comparison table. Every (row, column) pair has an entry; missing
/// values are `"N/A"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    /// Keyed by `"<row_id>_<col_id>"`, matching the wire layout.
    pub cells: HashMap<String, Cell>,
}

impl Table {
    pub fn cell_key(row_id: &str, col_id: &str) -> String {
        format!("{row_id}_{col_id}")
    }

    pub fn get(&self, row_id: &str, col_id: &str) -> Option<&Cell> {
        self.cells.get(&Self::cell_key(row_id, col_id))
    }

    pub fn set(&mut self, row_id: &str, col_id: &str, cell: Cell) {
        self.cells.insert(Self::cell_key(row_id, col_id), cell);
    }

    /// Fill any missing (row, column) pair with `"N/A"`.
    pub fn fill_missing(&mut self) {
        for row in &self.rows {
            for col in &self.columns {
                let key = Self::cell_key(&row.id, &col.id);
                self.cells.entry(key).or_insert_with(Cell::not_available);
            }
        }
    }

    /// True when every (row, column) pair has an entry.
    pub fn is_complete(&self) -> bool {
        self.rows.iter().all(|r| {
            self.columns
                .iter()
                .all(|c| self.cells.contains_key(&Self::cell_key(&r.id, &c.id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_2x2() -> Table {
        Table {
            columns: vec![
                Column {
                    id: "c1".into(),
                    name: "Model".into(),
                    description: "model name".into(),
                },
                Column {
                    id: "c2".into(),
                    name: "Params".into(),
                    description: "parameter count".into(),
                },
            ],
            rows: vec![
                Row {
                    id: "r1".into(),
                    corpus_id: "p1".into(),
                    label: "Smith 2021".into(),
                },
                Row {
                    id: "r2".into(),
                    corpus_id: "p2".into(),
                    label: "Lee 2022".into(),
                },
            ],
            cells: HashMap::new(),
        }
    }

    #[test]
    fn test_fill_missing_completes_table() {
        let mut t = table_2x2();
        t.set(
            "r1",
            "c1",
            Cell {
                value: "BERT".into(),
                evidence: None,
            },
        );
        assert!(!t.is_complete());
        t.fill_missing();
        assert!(t.is_complete());
        assert_eq!(t.get("r2", "c2").unwrap().value, "N/A");
        assert_eq!(t.get("r1", "c1").unwrap().value, "BERT");
    }

    #[test]
    fn test_cell_key_layout() {
        assert_eq!(Table::cell_key("r1", "c2"), "r1_c2");
    }
}
