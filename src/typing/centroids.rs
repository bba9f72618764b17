// src/typing/centroids.rs

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::keys;
use crate::error::{EngineError, IoContext, Result};

/// A named reference profile over the table's taxon columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCentroid {
    pub label: String,
    pub abundances: Vec<f64>,
}

/// The active centroid set and the fixed taxon order every abundance vector
/// is built against.
#[derive(Debug, Clone)]
pub struct CentroidTable {
    taxa: Vec<String>,
    centroids: Vec<ReferenceCentroid>,
}

impl CentroidTable {
    pub fn load(path: &Path, count: usize, label_column: &str) -> Result<Self> {
        let file = File::open(path).at(path)?;
        Self::from_reader(file, path, count, label_column)
    }

    /// Comma-separated with a header. Only the last `count` rows are
    /// parsed; every cell in them other than the label must be a
    /// non-negative number (empty cells read as 0).
    pub fn from_reader<R: Read>(
        reader: R,
        source: &Path,
        count: usize,
        label_column: &str,
    ) -> Result<Self> {
        let malformed = |msg: String| {
            EngineError::config(keys::CENTROIDS[0], format!("{}: {msg}", source.display()))
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| malformed(e.to_string()))?
            .clone();
        let label_idx = headers
            .iter()
            .position(|h| h == label_column)
            .ok_or_else(|| malformed(format!("no `{label_column}` label column")))?;
        let taxa: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != label_idx)
            .map(|(_, h)| h.to_string())
            .collect();
        if taxa.is_empty() {
            return Err(malformed("no taxon columns".to_string()));
        }

        let rows = rdr
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| malformed(e.to_string()))?;
        if rows.len() < count {
            return Err(malformed(format!(
                "expected at least {count} centroid rows, found {}",
                rows.len()
            )));
        }

        let first_active = rows.len() - count;
        let mut centroids = Vec::with_capacity(count);
        for (offset, row) in rows[first_active..].iter().enumerate() {
            // header is line 1
            let line = first_active + offset + 2;
            let label = row.get(label_idx).unwrap_or_default().to_string();
            if label.is_empty() {
                return Err(malformed(format!("line {line}: empty profile label")));
            }
            let mut abundances = Vec::with_capacity(taxa.len());
            for (i, cell) in row.iter().enumerate() {
                if i == label_idx {
                    continue;
                }
                let v = if cell.is_empty() {
                    0.0
                } else {
                    cell.parse::<f64>().map_err(|_| {
                        malformed(format!("line {line}: `{cell}` is not a number"))
                    })?
                };
                if !v.is_finite() || v < 0.0 {
                    return Err(malformed(format!(
                        "line {line}: abundance must be a non-negative number, got {cell}"
                    )));
                }
                abundances.push(v);
            }
            centroids.push(ReferenceCentroid { label, abundances });
        }

        log::info!(
            "loaded {} reference profiles over {} taxa from {}",
            centroids.len(),
            taxa.len(),
            source.display()
        );
        Ok(Self { taxa, centroids })
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn centroids(&self) -> &[ReferenceCentroid] {
        &self.centroids
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn load(text: &str, count: usize) -> Result<CentroidTable> {
        CentroidTable::from_reader(Cursor::new(text), Path::new("c.csv"), count, "sub_CST")
    }

    #[test]
    fn keeps_last_rows_and_label_column_anywhere() {
        let t = load(
            "A,sub_CST,B\n\
             9,notes,9\n\
             1.0,X,0\n\
             0,Y,1.0\n",
            2,
        )
        .unwrap();
        assert_eq!(t.taxa(), ["A", "B"]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.centroids()[0].label, "X");
        assert_eq!(t.centroids()[1].abundances, vec![0.0, 1.0]);
    }

    #[test]
    fn descriptive_rows_above_the_window_are_not_parsed() {
        let t = load("sub_CST,A\nsummary,n/a\nI-A,0.5\n", 1).unwrap();
        assert_eq!(t.centroids()[0].abundances, vec![0.5]);
    }

    #[test]
    fn malformed_tables_are_configuration_errors() {
        for (text, count) in [
            ("A,B\n1,2\n", 1),                 // no label column
            ("sub_CST,A\nX,abc\n", 1),         // non-numeric
            ("sub_CST,A\nX,-0.1\n", 1),        // negative
            ("sub_CST,A\nX,1\n", 2),           // too few rows
            ("sub_CST,A\nX,1,7\n", 1),         // ragged
            ("sub_CST\nX\n", 1),               // no taxa
        ] {
            let err = load(text, count).unwrap_err();
            assert!(err.is_configuration(), "{text:?}: {err}");
        }
    }

    #[test]
    fn empty_cells_read_as_zero() {
        let t = load("sub_CST,A,B\nX,,0.3\n", 1).unwrap();
        assert_eq!(t.centroids()[0].abundances, vec![0.0, 0.3]);
    }
}
