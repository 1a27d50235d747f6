//! Codebook mapping per-round channel codes to target (gene) names.
//!
//! On disk the codebook is JSON:
//!
//! ```json
//! {"version": "0.0.0",
//!  "mappings": [{"codeword": [{"r": 0, "c": 1, "v": 1}, {"r": 1, "c": 0, "v": 1}],
//!                "target": "ACTB"}]}
//! ```
//!
//! Each target must name exactly one channel with a non-zero value in every
//! round, which is what per-round max-channel decoding matches against.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or building a codebook.
#[derive(Debug, Error)]
pub enum CodebookError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("codebook has no entries")]
    Empty,

    #[error("target '{target}' has {count} active channels in round {round}, expected exactly one")]
    ChannelsPerRound {
        target: String,
        round: usize,
        count: usize,
    },

    #[error("target '{target}' uses round {round}/channel {ch} outside {num_rounds} rounds x {num_chs} channels")]
    OutOfRange {
        target: String,
        round: usize,
        ch: usize,
        num_rounds: usize,
        num_chs: usize,
    },

    #[error("target '{target}' has a {got}-round code, codebook has {expected} rounds")]
    CodeLength {
        target: String,
        expected: usize,
        got: usize,
    },

    #[error("targets '{first}' and '{second}' share the same code {code:?}")]
    DuplicateCode {
        first: String,
        second: String,
        code: Vec<usize>,
    },
}

/// Result type for codebook operations.
pub type Result<T> = std::result::Result<T, CodebookError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CodewordEntry {
    r: usize,
    c: usize,
    #[serde(default = "default_value")]
    v: f32,
}

fn default_value() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Mapping {
    codeword: Vec<CodewordEntry>,
    target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CodebookFile {
    #[serde(default = "default_version")]
    version: String,
    mappings: Vec<Mapping>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// One target and its expected channel per round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodebookEntry {
    pub target: String,
    pub code: Vec<usize>,
}

/// Immutable code -> target lookup.
#[derive(Debug, Clone)]
pub struct Codebook {
    num_rounds: usize,
    num_chs: usize,
    entries: Vec<CodebookEntry>,
    index: HashMap<Vec<usize>, usize>,
}

impl Codebook {
    /// Builds a codebook from `(target, channel per round)` pairs.
    pub fn new(num_rounds: usize, num_chs: usize, entries: Vec<CodebookEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(CodebookError::Empty);
        }
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if entry.code.len() != num_rounds {
                return Err(CodebookError::CodeLength {
                    target: entry.target.clone(),
                    expected: num_rounds,
                    got: entry.code.len(),
                });
            }
            for (round, &ch) in entry.code.iter().enumerate() {
                if ch >= num_chs {
                    return Err(CodebookError::OutOfRange {
                        target: entry.target.clone(),
                        round,
                        ch,
                        num_rounds,
                        num_chs,
                    });
                }
            }
            if let Some(&prev) = index.get(&entry.code) {
                let first: &CodebookEntry = &entries[prev];
                return Err(CodebookError::DuplicateCode {
                    first: first.target.clone(),
                    second: entry.target.clone(),
                    code: entry.code.clone(),
                });
            }
            index.insert(entry.code.clone(), i);
        }
        Ok(Self {
            num_rounds,
            num_chs,
            entries,
            index,
        })
    }

    /// Parses the JSON codebook format.
    ///
    /// `num_rounds` and `num_chs` are taken from the largest indices present,
    /// unless `shape` supplies them explicitly.
    pub fn from_json_str(json: &str, shape: Option<(usize, usize)>) -> Result<Self> {
        let file: CodebookFile = serde_json::from_str(json)?;
        Self::from_file_model(file, shape)
    }

    /// Loads a JSON codebook from disk.
    pub fn from_json<P: AsRef<Path>>(path: P, shape: Option<(usize, usize)>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: CodebookFile = serde_json::from_reader(reader)?;
        Self::from_file_model(file, shape)
    }

    fn from_file_model(file: CodebookFile, shape: Option<(usize, usize)>) -> Result<Self> {
        if file.mappings.is_empty() {
            return Err(CodebookError::Empty);
        }
        let (num_rounds, num_chs) = shape.unwrap_or_else(|| {
            let active = file
                .mappings
                .iter()
                .flat_map(|m| m.codeword.iter())
                .filter(|cw| cw.v != 0.0);
            let (mut r_max, mut c_max) = (0usize, 0usize);
            for cw in active {
                r_max = r_max.max(cw.r + 1);
                c_max = c_max.max(cw.c + 1);
            }
            (r_max, c_max)
        });

        let mut entries = Vec::with_capacity(file.mappings.len());
        for mapping in file.mappings {
            let mut code: Vec<Option<usize>> = vec![None; num_rounds];
            let mut counts = vec![0usize; num_rounds];
            for cw in mapping.codeword.iter().filter(|cw| cw.v != 0.0) {
                if cw.r >= num_rounds || cw.c >= num_chs {
                    return Err(CodebookError::OutOfRange {
                        target: mapping.target,
                        round: cw.r,
                        ch: cw.c,
                        num_rounds,
                        num_chs,
                    });
                }
                counts[cw.r] += 1;
                code[cw.r] = Some(cw.c);
            }
            if let Some(round) = counts.iter().position(|&n| n != 1) {
                return Err(CodebookError::ChannelsPerRound {
                    target: mapping.target,
                    round,
                    count: counts[round],
                });
            }
            entries.push(CodebookEntry {
                target: mapping.target,
                code: code.into_iter().flatten().collect(),
            });
        }
        Self::new(num_rounds, num_chs, entries)
    }

    /// Serializes to the JSON codebook format.
    pub fn to_json_string(&self) -> Result<String> {
        let file = CodebookFile {
            version: default_version(),
            mappings: self
                .entries
                .iter()
                .map(|e| Mapping {
                    target: e.target.clone(),
                    codeword: e
                        .code
                        .iter()
                        .enumerate()
                        .map(|(r, &c)| CodewordEntry { r, c, v: 1.0 })
                        .collect(),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    #[inline]
    pub fn num_rounds(&self) -> usize {
        self.num_rounds
    }

    #[inline]
    pub fn num_chs(&self) -> usize {
        self.num_chs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CodebookEntry] {
        &self.entries
    }

    /// Target whose code equals `code` exactly.
    pub fn lookup(&self, code: &[usize]) -> Option<&str> {
        self.index
            .get(code)
            .map(|&i| self.entries[i].target.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "version": "0.0.0",
        "mappings": [
            {"codeword": [{"r": 0, "c": 0, "v": 1}, {"r": 1, "c": 1, "v": 1}, {"r": 2, "c": 0, "v": 1}],
             "target": "G1"},
            {"codeword": [{"r": 0, "c": 1, "v": 1}, {"r": 1, "c": 1, "v": 1}, {"r": 2, "c": 1, "v": 1},
                          {"r": 2, "c": 0, "v": 0}],
             "target": "G2"}
        ]
    }"#;

    #[test]
    fn test_parse_json_codebook() {
        let codebook = Codebook::from_json_str(JSON, None).unwrap();
        assert_eq!(codebook.num_rounds(), 3);
        assert_eq!(codebook.num_chs(), 2);
        assert_eq!(codebook.len(), 2);
        assert_eq!(codebook.lookup(&[0, 1, 0]), Some("G1"));
        assert_eq!(codebook.lookup(&[1, 1, 1]), Some("G2"));
        assert_eq!(codebook.lookup(&[0, 0, 0]), None);
    }

    #[test]
    fn test_explicit_shape_allows_unused_channels() {
        let codebook = Codebook::from_json_str(JSON, Some((3, 4))).unwrap();
        assert_eq!(codebook.num_chs(), 4);
    }

    #[test]
    fn test_two_channels_in_one_round_rejected() {
        let json = r#"{"mappings": [{"codeword": [{"r": 0, "c": 0}, {"r": 0, "c": 1}], "target": "X"}]}"#;
        match Codebook::from_json_str(json, None).unwrap_err() {
            CodebookError::ChannelsPerRound { target, round, count } => {
                assert_eq!(target, "X");
                assert_eq!(round, 0);
                assert_eq!(count, 2);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_missing_round_rejected() {
        let json = r#"{"mappings": [
            {"codeword": [{"r": 0, "c": 0}, {"r": 1, "c": 0}], "target": "A"},
            {"codeword": [{"r": 0, "c": 1}], "target": "B"}]}"#;
        assert!(matches!(
            Codebook::from_json_str(json, None),
            Err(CodebookError::ChannelsPerRound { round: 1, count: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let entries = vec![
            CodebookEntry {
                target: "A".into(),
                code: vec![0, 1],
            },
            CodebookEntry {
                target: "B".into(),
                code: vec![0, 1],
            },
        ];
        assert!(matches!(
            Codebook::new(2, 2, entries),
            Err(CodebookError::DuplicateCode { .. })
        ));
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codebook.json");
        let codebook = Codebook::from_json_str(JSON, None).unwrap();
        std::fs::write(&path, codebook.to_json_string().unwrap()).unwrap();

        let loaded = Codebook::from_json(&path, None).unwrap();
        assert_eq!(loaded.entries(), codebook.entries());
    }
}
