//! Reading bpftrace's `-f json` output.
//!
//! bpftrace writes one JSON object per line. Only `value` lines carry records
//! for the encoder; `attached_probes` is reported and everything else is
//! skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader, IsTerminal};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// One line of bpftrace JSON output.
#[derive(Debug, Deserialize)]
pub struct BpftraceLine {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// What a line means to the converter.
#[derive(Debug, PartialEq)]
pub enum Line {
    /// The `data` of a `value` line, to be encoded.
    Record(Value),
    /// The number of probes bpftrace attached.
    AttachedProbes(u64),
    /// Any other line type (`printf`, `map`, `lost_events`, ...).
    Other(String),
}

impl BpftraceLine {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    pub fn into_line(self) -> Line {
        match self.kind.as_str() {
            "value" => Line::Record(self.data),
            "attached_probes" => {
                Line::AttachedProbes(self.data.get("probes").and_then(Value::as_u64).unwrap_or(0))
            }
            _ => Line::Other(self.kind),
        }
    }
}

/// Opens the input, preferring an explicit path over stdin.
///
/// Stdin is only used when it is not a terminal, so running the tool with no
/// input does not silently wait on the keyboard.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn BufRead>> {
    if let Some(path) = path {
        let file = File::open(path)
            .with_context(|| format!("Failed to open input file: {}", path.display()))?;
        return Ok(Box::new(BufReader::new(file)));
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        bail!("No input file given and stdin is a terminal; pipe bpftrace output in or pass a file");
    }
    Ok(Box::new(BufReader::new(stdin)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_value_line() {
        let line = BpftraceLine::parse(
            r#"{"type": "value", "data": ["track_descriptor", "name", "Top"]}"#,
        )
        .unwrap();
        assert_eq!(
            line.into_line(),
            Line::Record(json!(["track_descriptor", "name", "Top"]))
        );
    }

    #[test]
    fn test_attached_probes_line() {
        let line = BpftraceLine::parse(r#"{"type": "attached_probes", "data": {"probes": 3}}"#)
            .unwrap();
        assert_eq!(line.into_line(), Line::AttachedProbes(3));
    }

    #[test]
    fn test_other_lines() {
        let line = BpftraceLine::parse(r#"{"type": "printf", "data": "hello\n"}"#).unwrap();
        assert_eq!(line.into_line(), Line::Other("printf".to_string()));

        let line = BpftraceLine::parse(r#"{"type": "lost_events"}"#).unwrap();
        assert_eq!(line.into_line(), Line::Other("lost_events".to_string()));
    }

    #[test]
    fn test_malformed_line() {
        assert!(BpftraceLine::parse("not json").is_err());
        assert!(BpftraceLine::parse(r#"{"data": []}"#).is_err());
    }

    #[test]
    fn test_open_input_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "first").unwrap();
        writeln!(file, "second").unwrap();

        let reader = open_input(Some(file.path())).unwrap();
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[test]
    fn test_open_missing_file() {
        let err = open_input(Some(Path::new("/nonexistent/input.json")))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to open input file"));
    }
}
