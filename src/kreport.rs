// src/kreport.rs

//! Parsing of hierarchical classifier reports.
//!
//! Three tab-separated dialects are accepted:
//!   kraken2       %  clade  direct  rank  taxid  name
//!   minimizer     %  clade  direct  minimizers  distinct  rank  taxid  name
//!   krakenuniq    %  reads  taxReads  kmers  dup  cov  taxID  rank  taxName
//! Names may be indented with spaces (kraken2) or extra tabs.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::error::{EngineError, IoContext, Result};
use crate::types::ReportEntry;

/// Ranks tried when matching a reference taxon by name, most specific first.
pub const RANK_PREFERENCE: &[&str] = &["S", "G", "F", "O", "C", "P", "K", "D"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Kraken2,
    Minimizer,
    KrakenUniq,
}

impl Dialect {
    fn from_width(n: usize) -> Option<Self> {
        match n {
            6 | 7 => Some(Dialect::Kraken2),
            8 => Some(Dialect::Minimizer),
            n if n >= 9 => Some(Dialect::KrakenUniq),
            _ => None,
        }
    }

    /// Column indexes of (clade, direct, rank, taxid, name).
    fn columns(self) -> (usize, usize, usize, usize, usize) {
        match self {
            Dialect::Kraken2 => (1, 2, 3, 4, 5),
            Dialect::Minimizer => (1, 2, 5, 6, 7),
            Dialect::KrakenUniq => (1, 2, 7, 6, 8),
        }
    }
}

/// A parsed report with the unclassified entry removed.
#[derive(Debug, Clone, Default)]
pub struct ClassificationReport {
    entries: Vec<ReportEntry>,
    /// Clade reads of the root entry.
    total_reads: u64,
    by_rank: AHashMap<String, Vec<usize>>,
    by_name: AHashMap<String, Vec<usize>>,
}

impl ClassificationReport {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).at(path)?;
        Self::from_reader(BufReader::new(file), path)
    }

    pub fn from_reader<R: BufRead>(reader: R, source: &Path) -> Result<Self> {
        let mut dialect = None;
        let mut entries = Vec::new();
        let mut root: Option<u64> = None;

        for (idx, line) in reader.lines().enumerate() {
            let lineno = idx + 1;
            let line = line.at(source)?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('%') || line.starts_with("pct") {
                if line.contains("taxReads") {
                    dialect = Some(Dialect::KrakenUniq);
                }
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            let d = match dialect {
                Some(d) => d,
                None => {
                    let d = Dialect::from_width(fields.len())
                        .ok_or_else(|| bad_line(source, lineno, "unrecognised column layout"))?;
                    dialect = Some(d);
                    d
                }
            };
            let entry = parse_entry(d, &fields).map_err(|m| bad_line(source, lineno, m))?;

            if is_unclassified(&entry) {
                continue;
            }
            if is_root(&entry) {
                match root {
                    None => root = Some(entry.clade_reads),
                    Some(_) => log::warn!(
                        "{}:{lineno}: more than one root entry; keeping the first",
                        source.display()
                    ),
                }
            }
            entries.push(entry);
        }

        let total_reads = root.unwrap_or_else(|| {
            log::warn!("{}: no root entry; total reads taken as 0", source.display());
            0
        });

        let mut by_rank: AHashMap<String, Vec<usize>> = AHashMap::new();
        let mut by_name: AHashMap<String, Vec<usize>> = AHashMap::new();
        for (i, e) in entries.iter().enumerate() {
            by_rank.entry(e.rank.clone()).or_default().push(i);
            by_name.entry(normalize_taxon(&e.name)).or_default().push(i);
        }

        Ok(Self {
            entries,
            total_reads,
            by_rank,
            by_name,
        })
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn total_reads(&self) -> u64 {
        self.total_reads
    }

    /// Entries at one rank code, in report order.
    pub fn at_rank<'a>(&'a self, rank: &str) -> impl Iterator<Item = &'a ReportEntry> + 'a {
        self.by_rank
            .get(rank)
            .map(|v| v.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|&i| &self.entries[i])
    }

    /// Clade reads for a reference taxon name. A `g_`-style prefix pins the
    /// rank; otherwise the most specific rank carrying the name wins.
    /// Entries sharing name and rank are summed. Unmatched names give 0.
    pub fn reads_for(&self, taxon: &str) -> u64 {
        let (pinned, bare) = split_rank_prefix(taxon);
        let Some(candidates) = self.by_name.get(&normalize_taxon(bare)) else {
            return 0;
        };
        let ranks: &[&str] = match pinned {
            Some(ref r) => std::slice::from_ref(r),
            None => RANK_PREFERENCE,
        };
        ranks
            .iter()
            .find_map(|rank| {
                let hits: Vec<u64> = candidates
                    .iter()
                    .map(|&i| &self.entries[i])
                    .filter(|e| e.rank == *rank)
                    .map(|e| e.clade_reads)
                    .collect();
                (!hits.is_empty()).then(|| hits.iter().sum::<u64>())
            })
            .unwrap_or(0)
    }
}

fn bad_line(path: &Path, line: usize, message: impl Into<String>) -> EngineError {
    EngineError::Report {
        path: PathBuf::from(path),
        line,
        message: message.into(),
    }
}

fn parse_entry(d: Dialect, fields: &[&str]) -> std::result::Result<ReportEntry, String> {
    let (clade, direct, rank, taxid, name) = d.columns();
    if fields.len() <= name {
        return Err(format!("expected at least {} columns, got {}", name + 1, fields.len()));
    }
    let num = |i: usize, what: &str| -> std::result::Result<u64, String> {
        fields[i]
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("{what} is not an integer: `{}`", fields[i]))
    };
    let pct = fields[0]
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("percentage is not a number: `{}`", fields[0]))?;

    // Tab indentation shows up as empty fields ahead of the name.
    let tail = &fields[name..];
    let tab_depth = tail.iter().take_while(|f| f.is_empty()).count();
    let raw = tail[tab_depth..].join("\t");
    let space_depth = (raw.len() - raw.trim_start_matches(' ').len()) / 2;

    Ok(ReportEntry {
        pct,
        clade_reads: num(clade, "clade reads")?,
        direct_reads: num(direct, "direct reads")?,
        rank: normalize_rank(fields[rank]),
        tax_id: num(taxid, "taxon id")?,
        name: raw.trim().to_string(),
        depth: tab_depth + space_depth,
    })
}

fn is_unclassified(e: &ReportEntry) -> bool {
    e.rank == "U" || e.name.eq_ignore_ascii_case("unclassified")
}

fn is_root(e: &ReportEntry) -> bool {
    e.rank == "R" || (e.tax_id == 1 && e.name.eq_ignore_ascii_case("root"))
}

/// Word ranks to the single-letter codes kraken2 uses. Codes pass through.
pub fn normalize_rank(raw: &str) -> String {
    let raw = raw.trim();
    let code = match raw.to_ascii_lowercase().as_str() {
        "unclassified" => "U",
        "root" => "R",
        "superkingdom" | "domain" | "realm" => "D",
        "kingdom" => "K",
        "phylum" => "P",
        "class" => "C",
        "order" => "O",
        "family" => "F",
        "genus" => "G",
        "species" => "S",
        "subspecies" | "strain" => "S1",
        "no rank" | "sequence" | "assembly" | "" => "-",
        _ => return raw.to_ascii_uppercase(),
    };
    code.to_string()
}

/// Case, whitespace and underscore insensitive form of a taxon name.
pub fn normalize_taxon(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

static PREFIX_RANKS: &[(&str, &str)] = &[
    ("d_", "D"),
    ("k_", "K"),
    ("p_", "P"),
    ("c_", "C"),
    ("o_", "O"),
    ("f_", "F"),
    ("g_", "G"),
    ("s_", "S"),
];

fn split_rank_prefix(taxon: &str) -> (Option<&'static str>, &str) {
    let t = taxon.trim();
    for &(prefix, rank) in PREFIX_RANKS {
        let head = t.get(..prefix.len());
        if t.len() > prefix.len() && head.is_some_and(|h| h.eq_ignore_ascii_case(prefix)) {
            let rest = t[prefix.len()..].trim_start_matches('_');
            return (Some(rank), rest);
        }
    }
    (None, t)
}
