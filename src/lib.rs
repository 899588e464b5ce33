//! btetto library - encode bpftrace records as a Perfetto trace.
//!
//! bpftrace scripts print tuples such as
//! `("track_event", "name", "work", "type", "BEGIN", "ts", nsecs, "pid", pid, "tid", tid)`
//! with `-f json`. This crate turns those records into track descriptors,
//! track events and perf samples on a single interned Perfetto sequence.
//!
//! # Modules
//!
//! - [`encoder`] - Record encoding and the packet container
//! - [`driver`] - The JSON line read loop
//! - [`validate`] - Structural checks on finished traces
//!
//! # Example
//!
//! ```no_run
//! use btetto::TraceEncoder;
//! use serde_json::json;
//! use std::path::Path;
//!
//! let mut encoder = TraceEncoder::new();
//! encoder.encode_value(&json!(["track_descriptor", "name", "Top"]))?;
//! encoder.finish().write_to_file(Path::new("trace.binpb"))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod callstack;
pub mod driver;
pub mod encoder;
pub mod error;
pub mod ids;
pub mod input;
pub mod intern;
pub mod record;
pub mod sequence;
pub mod tracks;
pub mod validate;

// Re-export for convenience
pub use driver::{convert, ConvertStats};
pub use encoder::{Encoded, TraceContainer, TraceEncoder};
pub use error::EncodeError;
pub use validate::{
    validate_trace, validate_trace_file, ValidationError, ValidationResult, ValidationWarning,
};
