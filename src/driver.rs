//! The read loop: bpftrace JSON lines in, a finished trace out.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::encoder::{Encoded, TraceContainer, TraceEncoder};
use crate::input::{BpftraceLine, Line};

/// Counters reported when the conversion ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConvertStats {
    /// `value` records handed to the encoder.
    pub processed: u64,
    /// Records dropped because their track was never declared.
    pub skipped: u64,
    /// Whether the loop stopped early on an interrupt.
    pub interrupted: bool,
}

/// Encodes every record read from `reader` until EOF or until `stop` is set.
///
/// `stop` is checked before each read, so the line that was being read when
/// it was set is still encoded. Any fatal record aborts the conversion and
/// nothing is returned. A line that fails to parse after `stop` was set is
/// treated as the truncated tail of an interrupted run and ends the loop.
pub fn convert<R: BufRead>(reader: R, stop: &AtomicBool) -> Result<(TraceContainer, ConvertStats)> {
    let mut encoder = TraceEncoder::new();
    let mut stats = ConvertStats::default();
    let mut lines = reader.lines();
    let mut line_no = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            stats.interrupted = true;
            break;
        }
        let Some(line) = lines.next() else {
            break;
        };
        line_no += 1;
        let line = line.with_context(|| format!("Failed to read input line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed = match BpftraceLine::parse(&line) {
            Ok(parsed) => parsed,
            Err(_) if stop.load(Ordering::SeqCst) => {
                stats.interrupted = true;
                break;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Invalid JSON on input line {line_no}"))
            }
        };

        match parsed.into_line() {
            Line::Record(data) => {
                stats.processed += 1;
                let outcome = encoder
                    .encode_value(&data)
                    .with_context(|| format!("Invalid record on input line {line_no}: {data}"))?;
                if let Encoded::Skipped { .. } = outcome {
                    stats.skipped += 1;
                }
            }
            Line::AttachedProbes(probes) => info!("Attached {} probes", probes),
            Line::Other(kind) => debug!("Ignoring '{}' line", kind),
        }
    }

    Ok((encoder.finish(), stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Read};

    /// Sets `stop` once `lines` newlines have been consumed, the way a Ctrl-C
    /// lands while the driver is blocked reading.
    struct InterruptAfter<'a> {
        inner: Cursor<&'static str>,
        lines: usize,
        stop: &'a AtomicBool,
    }

    impl Read for InterruptAfter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = {
                let available = self.fill_buf()?;
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                n
            };
            self.consume(n);
            Ok(n)
        }
    }

    impl BufRead for InterruptAfter<'_> {
        fn fill_buf(&mut self) -> io::Result<&[u8]> {
            self.inner.fill_buf()
        }

        fn consume(&mut self, amt: usize) {
            let newlines = self
                .inner
                .fill_buf()
                .map(|buf| buf[..amt].iter().filter(|&&b| b == b'\n').count())
                .unwrap_or(0);
            self.inner.consume(amt);
            if newlines > 0 && self.lines > 0 {
                self.lines = self.lines.saturating_sub(newlines);
                if self.lines == 0 {
                    self.stop.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    const INPUT: &str = r#"{"type": "attached_probes", "data": {"probes": 2}}
{"type": "value", "data": ["track_descriptor", "name", "Top"]}

{"type": "printf", "data": "ignored\n"}
{"type": "value", "data": ["track_event", "name", "e", "type", "INSTANT", "ts", 1, "track_name", "Top"]}
{"type": "value", "data": ["track_event", "name", "e", "type", "INSTANT", "ts", 2, "track_name", "Missing"]}
{"type": "value", "data": []}
"#;

    #[test]
    fn test_convert_counts_records() {
        let stop = AtomicBool::new(false);
        let (container, stats) = convert(Cursor::new(INPUT), &stop).unwrap();
        assert_eq!(container.len(), 2);
        assert_eq!(
            stats,
            ConvertStats {
                processed: 4,
                skipped: 1,
                interrupted: false
            }
        );
    }

    #[test]
    fn test_fatal_record_reports_line() {
        let input = concat!(
            r#"{"type": "value", "data": ["track_descriptor", "name", "Top"]}"#,
            "\n",
            r#"{"type": "value", "data": ["track_event", "name", "e", "type", "BEGIN", "ts", 1]}"#,
            "\n",
        );
        let stop = AtomicBool::new(false);
        let err = convert(Cursor::new(input), &stop).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn test_bad_json_is_fatal() {
        let stop = AtomicBool::new(false);
        let err = convert(Cursor::new("{\"type\": \"val"), &stop).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON on input line 1"));
    }

    #[test]
    fn test_interrupt_stops_before_reading() {
        let stop = AtomicBool::new(true);
        let (container, stats) = convert(Cursor::new(INPUT), &stop).unwrap();
        assert!(container.is_empty());
        assert!(stats.interrupted);
        assert_eq!(stats.processed, 0);
    }

    #[test]
    fn test_interrupt_keeps_encoded_records() {
        let input = concat!(
            r#"{"type": "value", "data": ["track_descriptor", "name", "Top"]}"#,
            "\n",
            r#"{"type": "value", "data": ["track_event", "name", "e", "type", "INSTANT", "ts", 1, "track_name", "Top"]}"#,
            "\n",
            r#"{"type": "value", "data": ["track_descriptor", "name", "Never"]}"#,
            "\n",
        );
        let stop = AtomicBool::new(false);
        let reader = InterruptAfter {
            inner: Cursor::new(input),
            lines: 2,
            stop: &stop,
        };

        let (container, stats) = convert(reader, &stop).unwrap();
        assert_eq!(container.len(), 2);
        assert!(container.packets()[1].has_track_event());
        assert_eq!(
            stats,
            ConvertStats {
                processed: 2,
                skipped: 0,
                interrupted: true
            }
        );
    }

    #[test]
    fn test_truncated_line_after_interrupt_ends_cleanly() {
        let input = concat!(
            r#"{"type": "value", "data": ["track_descriptor", "name", "Top"]}"#,
            "\n",
            r#"{"type": "value", "data": ["track_ev"#,
            "\n",
        );
        let stop = AtomicBool::new(false);
        let reader = InterruptAfter {
            inner: Cursor::new(input),
            lines: 2,
            stop: &stop,
        };

        let (container, stats) = convert(reader, &stop).unwrap();
        assert_eq!(container.len(), 1);
        assert_eq!(stats.processed, 1);
        assert!(stats.interrupted);
    }
}
