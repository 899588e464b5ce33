//! Trace validation module.
//!
//! Checks an encoded Perfetto trace for the structural properties trace
//! processors rely on: every referenced track and interned id was introduced
//! earlier on the sequence, the track hierarchy is a tree, and the sequence
//! flags mark exactly one start.
//!
//! # Example
//!
//! ```no_run
//! use btetto::validate::validate_trace_file;
//! use std::path::Path;
//!
//! let result = validate_trace_file(Path::new("bpftrace_trace.binpb"));
//! if result.has_errors() {
//!     for error in &result.errors {
//!         eprintln!("Error: {}", error);
//!     }
//! }
//! ```

use perfetto_protos::interned_data::InternedData;
use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::TracePacket;
use protobuf::Message;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

/// Result of validating a trace.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Errors that indicate an invalid trace.
    pub errors: Vec<ValidationError>,
    /// Warnings that indicate potential issues.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Returns true if the trace is valid (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }
}

/// Validation error types.
#[derive(Debug, PartialEq)]
pub enum ValidationError {
    /// The trace file could not be read or decoded.
    ReadError { message: String },
    /// A track event points at a track that was never described.
    UndefinedTrack { track_uuid: u64, timestamp: u64 },
    /// A track descriptor names a parent that was never described.
    UndefinedParent { track_uuid: u64, parent_uuid: u64 },
    /// The parent links loop back on themselves.
    ParentCycle { track_uuid: u64 },
    /// An interned id is used before any packet introduced it.
    MissingInternedId {
        packet: usize,
        table: &'static str,
        iid: u64,
    },
    /// The first-packet markers are missing or repeated.
    SequenceFlags { packet: usize, message: String },
    /// A thread descriptor has no thread name.
    MissingThreadName { track_uuid: u64, tid: i32 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::ReadError { message } => write!(f, "read error: {message}"),
            ValidationError::UndefinedTrack {
                track_uuid,
                timestamp,
            } => {
                write!(
                    f,
                    "TrackEvent at {timestamp} references undefined track_uuid {track_uuid}"
                )
            }
            ValidationError::UndefinedParent {
                track_uuid,
                parent_uuid,
            } => {
                write!(
                    f,
                    "TrackDescriptor {track_uuid} has parent_uuid {parent_uuid} which is not defined"
                )
            }
            ValidationError::ParentCycle { track_uuid } => {
                write!(
                    f,
                    "Cycle detected in track parent hierarchy involving track {track_uuid}"
                )
            }
            ValidationError::MissingInternedId { packet, table, iid } => {
                write!(
                    f,
                    "packet {packet}: {table} iid {iid} used before it was interned"
                )
            }
            ValidationError::SequenceFlags { packet, message } => {
                write!(f, "packet {packet}: {message}")
            }
            ValidationError::MissingThreadName { track_uuid, tid } => {
                write!(
                    f,
                    "ThreadDescriptor (track_uuid={track_uuid}, tid={tid}) has empty or missing thread_name"
                )
            }
        }
    }
}

/// Validation warning types.
#[derive(Debug, PartialEq)]
pub enum ValidationWarning {
    /// The trace has no packets.
    EmptyTrace,
    /// The same track uuid was described more than once.
    DuplicateTrack { track_uuid: u64 },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::EmptyTrace => write!(f, "trace contains no packets"),
            ValidationWarning::DuplicateTrack { track_uuid } => {
                write!(f, "track_uuid {track_uuid} is described more than once")
            }
        }
    }
}

/// Validate a Perfetto trace file.
pub fn validate_trace_file(path: &Path) -> ValidationResult {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            let mut result = ValidationResult::default();
            result.add_error(ValidationError::ReadError {
                message: format!("Failed to open trace file {}: {e}", path.display()),
            });
            return result;
        }
    };

    match Trace::parse_from_bytes(&bytes) {
        Ok(trace) => validate_trace(&trace),
        Err(e) => {
            let mut result = ValidationResult::default();
            result.add_error(ValidationError::ReadError {
                message: format!("Failed to parse trace: {e}"),
            });
            result
        }
    }
}

/// Validate an in-memory trace.
///
/// Checks:
/// - Track UUIDs are defined before being referenced
/// - Parent UUIDs form a valid tree
/// - Interned ids are introduced before they are used
/// - Only the first packet is flagged as first on the sequence
/// - Thread descriptors carry a name
pub fn validate_trace(trace: &Trace) -> ValidationResult {
    let mut result = ValidationResult::default();
    if trace.packet.is_empty() {
        result.add_warning(ValidationWarning::EmptyTrace);
        return result;
    }

    let mut context = ValidationContext::default();
    for (index, packet) in trace.packet.iter().enumerate() {
        validate_sequence_flags(index, packet, &mut result);
        validate_packet(index, packet, &mut context, &mut result);
    }

    validate_parent_uuid_hierarchy(&context, &mut result);
    result
}

/// Interned ids introduced so far, per table.
#[derive(Default)]
struct InternedIds {
    event_names: HashSet<u64>,
    debug_annotation_names: HashSet<u64>,
    debug_annotation_string_values: HashSet<u64>,
    function_names: HashSet<u64>,
    frames: HashSet<u64>,
    callstacks: HashSet<u64>,
    mappings: HashSet<u64>,
    log_message_body: HashSet<u64>,
}

impl InternedIds {
    fn add(&mut self, interned: &InternedData) {
        self.event_names
            .extend(interned.event_names.iter().map(|e| e.iid()));
        self.debug_annotation_names
            .extend(interned.debug_annotation_names.iter().map(|e| e.iid()));
        self.debug_annotation_string_values.extend(
            interned
                .debug_annotation_string_values
                .iter()
                .map(|e| e.iid()),
        );
        self.function_names
            .extend(interned.function_names.iter().map(|e| e.iid()));
        self.frames.extend(interned.frames.iter().map(|e| e.iid()));
        self.callstacks
            .extend(interned.callstacks.iter().map(|e| e.iid()));
        self.mappings.extend(interned.mappings.iter().map(|e| e.iid()));
        self.log_message_body
            .extend(interned.log_message_body.iter().map(|e| e.iid()));
    }
}

#[derive(Default)]
struct ValidationContext {
    defined_tracks: HashSet<u64>,
    /// child_uuid -> parent_uuid
    parent_refs: HashMap<u64, u64>,
    interned: InternedIds,
}

fn check_iid(
    known: &HashSet<u64>,
    packet: usize,
    table: &'static str,
    iid: u64,
    result: &mut ValidationResult,
) {
    if !known.contains(&iid) {
        result.add_error(ValidationError::MissingInternedId { packet, table, iid });
    }
}

fn validate_sequence_flags(index: usize, packet: &TracePacket, result: &mut ValidationResult) {
    let first = packet.first_packet_on_sequence();
    if index == 0 && !first {
        result.add_error(ValidationError::SequenceFlags {
            packet: index,
            message: "first packet is not marked first_packet_on_sequence".to_string(),
        });
    } else if index > 0 && first {
        result.add_error(ValidationError::SequenceFlags {
            packet: index,
            message: "only the first packet may set first_packet_on_sequence".to_string(),
        });
    }
}

fn validate_packet(
    index: usize,
    packet: &TracePacket,
    context: &mut ValidationContext,
    result: &mut ValidationResult,
) {
    // Ids a packet interns are usable by that packet itself.
    if let Some(interned) = packet.interned_data.as_ref() {
        context.interned.add(interned);
        for frame in &interned.frames {
            let known = &context.interned;
            check_iid(
                &known.function_names,
                index,
                "function_names",
                frame.function_name_id(),
                result,
            );
            check_iid(&known.mappings, index, "mappings", frame.mapping_id(), result);
        }
        for callstack in &interned.callstacks {
            for &frame_id in &callstack.frame_ids {
                check_iid(&context.interned.frames, index, "frames", frame_id, result);
            }
        }
    }

    if packet.has_track_descriptor() {
        let desc = packet.track_descriptor();
        let uuid = desc.uuid();

        if !context.defined_tracks.insert(uuid) {
            result.add_warning(ValidationWarning::DuplicateTrack { track_uuid: uuid });
        }
        if desc.has_parent_uuid() {
            context.parent_refs.insert(uuid, desc.parent_uuid());
        }
        if let Some(thread) = desc.thread.as_ref() {
            if !thread.has_thread_name() || thread.thread_name().is_empty() {
                result.add_error(ValidationError::MissingThreadName {
                    track_uuid: uuid,
                    tid: thread.tid(),
                });
            }
        }
    }

    if packet.has_track_event() {
        let event = packet.track_event();
        let known = &context.interned;

        if event.has_track_uuid() && !context.defined_tracks.contains(&event.track_uuid()) {
            result.add_error(ValidationError::UndefinedTrack {
                track_uuid: event.track_uuid(),
                timestamp: packet.timestamp(),
            });
        }
        if event.has_name_iid() {
            check_iid(&known.event_names, index, "event_names", event.name_iid(), result);
        }
        for annotation in &event.debug_annotations {
            if annotation.has_name_iid() {
                check_iid(
                    &known.debug_annotation_names,
                    index,
                    "debug_annotation_names",
                    annotation.name_iid(),
                    result,
                );
            }
            if annotation.has_string_value_iid() {
                check_iid(
                    &known.debug_annotation_string_values,
                    index,
                    "debug_annotation_string_values",
                    annotation.string_value_iid(),
                    result,
                );
            }
        }
        if let Some(log) = event.log_message.as_ref() {
            check_iid(
                &known.log_message_body,
                index,
                "log_message_body",
                log.body_iid(),
                result,
            );
        }
    }

    if packet.has_perf_sample() {
        let sample = packet.perf_sample();
        if sample.has_callstack_iid() {
            check_iid(
                &context.interned.callstacks,
                index,
                "callstacks",
                sample.callstack_iid(),
                result,
            );
        }
    }
}

/// Validate that parent_uuid references form a valid tree (no orphans or cycles).
fn validate_parent_uuid_hierarchy(context: &ValidationContext, result: &mut ValidationResult) {
    for (&child_uuid, &parent_uuid) in &context.parent_refs {
        if !context.defined_tracks.contains(&parent_uuid) {
            result.add_error(ValidationError::UndefinedParent {
                track_uuid: child_uuid,
                parent_uuid,
            });
        }
    }

    for start_uuid in context.parent_refs.keys() {
        let mut visited = HashSet::new();
        let mut current = *start_uuid;

        while let Some(&parent) = context.parent_refs.get(&current) {
            if !visited.insert(current) {
                result.add_error(ValidationError::ParentCycle {
                    track_uuid: current,
                });
                return;
            }
            current = parent;
        }
    }
}
