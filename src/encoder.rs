//! Turns raw bpftrace records into Perfetto trace packets.
//!
//! [`TraceEncoder`] owns every table that has to survive between records (ids,
//! interned values, tracks, flows, sequence state) together with the packets
//! emitted so far. Records are encoded one at a time and in order; a record
//! either appends all of its packets or, when it is rejected, leaves the
//! encoder untouched.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use perfetto_protos::debug_annotation::DebugAnnotation;
use perfetto_protos::interned_data::InternedData;
use perfetto_protos::log_message::log_message::Priority;
use perfetto_protos::log_message::LogMessage;
use perfetto_protos::profile_common::Mapping;
use perfetto_protos::profile_packet::profiling::CpuMode;
use perfetto_protos::profile_packet::PerfSample;
use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::TracePacket;
use perfetto_protos::track_descriptor::TrackDescriptor;
use perfetto_protos::track_event::track_event::Type;
use perfetto_protos::track_event::TrackEvent;
use protobuf::Message;
use serde_json::Value;
use tracing::{debug, warn};

use crate::callstack;
use crate::error::{EncodeError, Result};
use crate::ids::IdRegistry;
use crate::intern::{InternTables, StringKind, DUMMY_MAPPING_IID};
use crate::record::{
    text, value_as_i32, value_as_str, value_as_u32, Fields, RawRecord, RecordKind,
};
use crate::sequence::SequenceState;
use crate::tracks::{CounterUnit, EnsuredTrack, TrackManager, UNKNOWN_THREAD_NAME};

/// Keys starting with this prefix become debug annotations.
pub const ANNOTATION_PREFIX: &str = "__a_";

const TRACK_EVENT: &str = "track event";
const CALL_STACK: &str = "call stack sample";

/// The ordered packets of the trace being built.
///
/// Packets are only ever appended.
#[derive(Debug, Default)]
pub struct TraceContainer {
    trace: Trace,
}

impl TraceContainer {
    fn push(&mut self, packet: TracePacket) {
        self.trace.packet.push(packet);
    }

    pub fn packets(&self) -> &[TracePacket] {
        &self.trace.packet
    }

    pub fn len(&self) -> usize {
        self.trace.packet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.packet.is_empty()
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        self.trace
            .write_to_bytes()
            .context("Failed to serialize Perfetto trace")
    }

    pub fn write_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)
            .with_context(|| format!("Failed to write trace file: {}", path.display()))
    }
}

/// What encoding a record did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// This many packets were appended.
    Appended(usize),
    /// The record referenced a track that was never declared and was dropped.
    Skipped { track_name: String },
    /// The record was empty.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Begin,
    End,
    Instant,
    Counter,
}

impl EventType {
    pub const VALID: &'static str = "BEGIN, COUNTER, END, INSTANT";

    pub fn parse(event_type: &str) -> Result<Self> {
        match event_type {
            "BEGIN" => Ok(EventType::Begin),
            "END" => Ok(EventType::End),
            "INSTANT" => Ok(EventType::Instant),
            "COUNTER" => Ok(EventType::Counter),
            _ => Err(EncodeError::InvalidEnum {
                key: "type",
                value: event_type.to_string(),
                valid: Self::VALID,
            }),
        }
    }
}

impl From<EventType> for Type {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Begin => Type::TYPE_SLICE_BEGIN,
            EventType::End => Type::TYPE_SLICE_END,
            EventType::Instant => Type::TYPE_INSTANT,
            EventType::Counter => Type::TYPE_COUNTER,
        }
    }
}

fn parse_log_priority(level: &str) -> Result<Priority> {
    match level {
        "UNSPECIFIED" => Ok(Priority::PRIO_UNSPECIFIED),
        "UNUSED" => Ok(Priority::PRIO_UNUSED),
        "VERBOSE" => Ok(Priority::PRIO_VERBOSE),
        "DEBUG" => Ok(Priority::PRIO_DEBUG),
        "INFO" => Ok(Priority::PRIO_INFO),
        "WARN" => Ok(Priority::PRIO_WARN),
        "ERROR" => Ok(Priority::PRIO_ERROR),
        "FATAL" => Ok(Priority::PRIO_FATAL),
        _ => Err(EncodeError::InvalidEnum {
            key: "log_level",
            value: level.to_string(),
            valid: "UNSPECIFIED, UNUSED, VERBOSE, DEBUG, INFO, WARN, ERROR, FATAL",
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CounterValue {
    Int(i64),
    Double(f64),
}

impl CounterValue {
    fn parse(value: &Value) -> Result<Self> {
        if let Some(v) = value.as_i64() {
            return Ok(CounterValue::Int(v));
        }
        match value.as_f64() {
            Some(v) => Ok(CounterValue::Double(v)),
            None => Err(EncodeError::InvalidValue {
                key: "counter_value".to_string(),
                message: format!("expected a number, got {value}"),
            }),
        }
    }
}

/// Where a track event goes, decided before anything is mutated.
enum EventTrack {
    Known(u64),
    Thread {
        pid: i32,
        tid: i32,
        thread_name: String,
    },
}

/// Outcome of validating a track event.
enum EventCheck {
    Ready(CheckedEvent),
    UnknownTrack(String),
}

/// A track event that passed validation.
struct CheckedEvent {
    name: String,
    event_type: EventType,
    ts: u64,
    track: EventTrack,
    counter: Option<CounterValue>,
    log: Option<(String, Priority)>,
}

/// A call stack sample that passed validation.
struct CheckedSample<'a> {
    ts: u64,
    pid: i32,
    tid: i32,
    cpu: Option<u32>,
    thread_name: String,
    kernel: Option<&'a str>,
    user: Option<&'a str>,
}

static NULL: Value = Value::Null;

/// Element at a position the caller already bounds-checked.
fn positional(record: &RawRecord, index: usize) -> &Value {
    record.at(index).unwrap_or(&NULL)
}

fn thread_name(fields: &Fields) -> String {
    fields
        .get("thread_name")
        .map_or_else(|| UNKNOWN_THREAD_NAME.to_string(), |v| text(v).into_owned())
}

fn optional_str<'a>(fields: &'a Fields, key: &str) -> Result<Option<&'a str>> {
    fields
        .get(key)
        .map(|value| value_as_str(key, value))
        .transpose()
}

fn expect_key(
    record: &RawRecord,
    kind: &'static str,
    index: usize,
    key: &'static str,
) -> Result<()> {
    let got = text(positional(record, index));
    if got != key {
        return Err(EncodeError::UnexpectedKey {
            record: kind,
            position: index + 1,
            expected: key,
            got: got.into_owned(),
        });
    }
    Ok(())
}

/// pid/tid of a perf sample, which the sample stores unsigned.
fn sample_id(fields: &Fields, key: &'static str) -> Result<i32> {
    let id = fields.require_i32(CALL_STACK, key)?;
    if id < 0 {
        return Err(EncodeError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a non-negative id, got {id}"),
        });
    }
    Ok(id)
}

fn build_annotation(
    tables: &mut InternTables,
    ids: &mut IdRegistry,
    interned: &mut InternedData,
    name: &str,
    value: &Value,
) -> DebugAnnotation {
    let mut annotation = DebugAnnotation::default();
    let (name_iid, _) = tables.intern_string(ids, interned, StringKind::DebugAnnotationName, name);
    annotation.set_name_iid(name_iid);

    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                annotation.set_int_value(v);
            } else if let Some(v) = n.as_u64() {
                annotation.set_uint_value(v);
            } else if let Some(v) = n.as_f64() {
                annotation.set_double_value(v);
            }
        }
        Value::Bool(v) => annotation.set_bool_value(*v),
        other => {
            let (value_iid, _) = tables.intern_string(
                ids,
                interned,
                StringKind::DebugAnnotationStringValue,
                &text(other),
            );
            annotation.set_string_value_iid(value_iid);
        }
    }
    annotation
}

fn attach_interned(packet: &mut TracePacket, interned: InternedData) {
    if interned != InternedData::default() {
        packet.interned_data = Some(interned).into();
    }
}

/// Encoder state for one trace.
#[derive(Debug, Default)]
pub struct TraceEncoder {
    ids: IdRegistry,
    tables: InternTables,
    tracks: TrackManager,
    flows: HashMap<String, u64>,
    sequence: SequenceState,
    mapping_emitted: bool,
    container: TraceContainer,
}

impl TraceEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes the `data` member of a bpftrace `value` line.
    pub fn encode_value(&mut self, data: &Value) -> Result<Encoded> {
        match RawRecord::from_value(data)? {
            Some(record) => self.encode(&record),
            None => Ok(Encoded::Ignored),
        }
    }

    pub fn encode(&mut self, record: &RawRecord) -> Result<Encoded> {
        let before = self.container.len();
        let outcome = match record.kind() {
            RecordKind::TrackDescriptor => self.encode_track_descriptor(record)?,
            RecordKind::TrackEvent => self.encode_track_event(record)?,
            RecordKind::CallStack => self.encode_call_stack(record)?,
        };
        if let Some(skipped) = outcome {
            return Ok(skipped);
        }
        Ok(Encoded::Appended(self.container.len() - before))
    }

    pub fn container(&self) -> &TraceContainer {
        &self.container
    }

    /// Hands back everything encoded so far.
    pub fn finish(self) -> TraceContainer {
        self.container
    }

    pub fn tracks(&self) -> &TrackManager {
        &self.tracks
    }

    pub fn tables(&self) -> &InternTables {
        &self.tables
    }

    pub fn flow_id(&self, name: &str) -> Option<u64> {
        self.flows.get(name).copied()
    }

    fn push_packet(&mut self, mut packet: TracePacket) {
        self.sequence.stamp(&mut packet);
        self.container.push(packet);
    }

    fn push_track(&mut self, track: EnsuredTrack) -> u64 {
        if let Some(desc) = track.descriptor {
            self.push_descriptor(desc);
        }
        track.uuid
    }

    fn push_descriptor(&mut self, desc: TrackDescriptor) {
        debug!("New track descriptor {}", desc.uuid());
        let mut packet = TracePacket::default();
        packet.set_track_descriptor(desc);
        self.push_packet(packet);
    }

    // Valid track descriptor records:
    // ("track_descriptor", "name", "my custom track", "parent", "Top Parent")
    // ("track_descriptor", "thread_name", comm, "pid", pid, "tid", tid)
    // ("track_descriptor", "counter", "counter name", "unit", "count")
    fn encode_track_descriptor(&mut self, record: &RawRecord) -> Result<Option<Encoded>> {
        let len = record.len();
        let descriptor_type = text(positional(record, 1));

        match &*descriptor_type {
            "name" => {
                if len != 3 && len != 5 {
                    return Err(EncodeError::FieldCount {
                        record: "track descriptor name",
                        expected: "3 or 5",
                        got: len,
                    });
                }
                let parent = if len == 5 {
                    expect_key(record, "track descriptor name", 3, "parent")?;
                    Some(text(positional(record, 4)))
                } else {
                    None
                };
                let name = text(positional(record, 2));
                let track =
                    self.tracks
                        .ensure_named_track(&mut self.ids, &name, parent.as_deref())?;
                self.push_track(track);
            }
            "thread_name" => {
                if len != 7 {
                    return Err(EncodeError::FieldCount {
                        record: "track descriptor thread",
                        expected: "7",
                        got: len,
                    });
                }
                expect_key(record, "track descriptor thread", 3, "pid")?;
                expect_key(record, "track descriptor thread", 5, "tid")?;
                let pid = value_as_i32("pid", positional(record, 4))?;
                let tid = value_as_i32("tid", positional(record, 6))?;
                let name = text(positional(record, 2));
                let track = self.tracks.ensure_thread_track(&mut self.ids, pid, tid, &name);
                self.push_track(track);
            }
            "counter" => {
                if len != 5 {
                    return Err(EncodeError::FieldCount {
                        record: "track descriptor counter",
                        expected: "5",
                        got: len,
                    });
                }
                expect_key(record, "track descriptor counter", 3, "unit")?;
                let unit = CounterUnit::parse(&text(positional(record, 4)))?;
                let name = text(positional(record, 2));
                let track = self.tracks.ensure_counter_track(&mut self.ids, &name, unit);
                self.push_track(track);
            }
            other => return Err(EncodeError::UnknownDescriptorKind(other.to_string())),
        }
        Ok(None)
    }

    fn check_track_event(&self, record: &RawRecord) -> Result<EventCheck> {
        if record.len() < 7 {
            return Err(EncodeError::FieldCount {
                record: TRACK_EVENT,
                expected: "at least 7",
                got: record.len(),
            });
        }

        let fields = record.fields();
        let name = fields.get("name").ok_or(EncodeError::MissingKey {
            record: TRACK_EVENT,
            key: "name",
        })?;
        let event_type = fields.get("type").ok_or(EncodeError::MissingKey {
            record: TRACK_EVENT,
            key: "type",
        })?;
        let event_type = EventType::parse(&text(event_type))?;
        let ts = fields.require_u64(TRACK_EVENT, "ts")?;

        let track = if let Some(track_name) = fields.get("track_name") {
            let track_name = text(track_name);
            match self.tracks.lookup_named_track(&track_name) {
                Some(uuid) => EventTrack::Known(uuid),
                None => return Ok(EventCheck::UnknownTrack(track_name.into_owned())),
            }
        } else if fields.contains("pid") && fields.contains("tid") {
            EventTrack::Thread {
                pid: fields.require_i32(TRACK_EVENT, "pid")?,
                tid: fields.require_i32(TRACK_EVENT, "tid")?,
                thread_name: thread_name(fields),
            }
        } else {
            return Err(EncodeError::NoTrack);
        };

        let counter = if event_type == EventType::Counter {
            if !fields.contains("track_name") {
                return Err(EncodeError::MissingKey {
                    record: "counter event",
                    key: "track_name",
                });
            }
            let value = fields.get("counter_value").ok_or(EncodeError::MissingKey {
                record: "counter event",
                key: "counter_value",
            })?;
            Some(CounterValue::parse(value)?)
        } else {
            None
        };

        let log = match (event_type, fields.get("log")) {
            (EventType::Counter, _) | (_, None) => None,
            (_, Some(body)) => {
                let priority = match fields.get("log_level") {
                    Some(level) => parse_log_priority(&text(level))?,
                    None => Priority::PRIO_UNSPECIFIED,
                };
                Some((text(body).into_owned(), priority))
            }
        };

        Ok(EventCheck::Ready(CheckedEvent {
            name: text(name).into_owned(),
            event_type,
            ts,
            track,
            counter,
            log,
        }))
    }

    // Example track event records:
    // ("track_event", "name", "page_fault_user", "type", "BEGIN", "ts", $start, "pid", pid, "tid", tid, "thread_name", comm)
    // ("track_event", "name", "page_fault_user", "type", "COUNTER", "ts", $start, "track_name", "Faults", "counter_value", @c)
    // ("track_event", "name", "page_fault_user", "type", "INSTANT", "ts", $start, "pid", pid, "tid", tid, "__a_greeting", "hello")
    fn encode_track_event(&mut self, record: &RawRecord) -> Result<Option<Encoded>> {
        let event = match self.check_track_event(record)? {
            EventCheck::Ready(event) => event,
            EventCheck::UnknownTrack(track_name) => {
                warn!(
                    "Track name '{}' not found in track descriptors. You must emit a track_descriptor record for each track_name track_event. Skipping",
                    track_name
                );
                return Ok(Some(Encoded::Skipped { track_name }));
            }
        };

        let track_uuid = match event.track {
            EventTrack::Known(uuid) => uuid,
            EventTrack::Thread {
                pid,
                tid,
                ref thread_name,
            } => {
                let track = self
                    .tracks
                    .ensure_thread_track(&mut self.ids, pid, tid, thread_name);
                self.push_track(track)
            }
        };

        let mut interned = InternedData::default();
        let mut track_event = TrackEvent::default();
        track_event.set_track_uuid(track_uuid);
        track_event.set_type(event.event_type.into());

        let (name_iid, _) = self.tables.intern_string(
            &mut self.ids,
            &mut interned,
            StringKind::EventName,
            &event.name,
        );
        track_event.set_name_iid(name_iid);

        match event.counter {
            Some(CounterValue::Int(v)) => track_event.set_counter_value(v),
            Some(CounterValue::Double(v)) => track_event.set_double_counter_value(v),
            None => {}
        }

        if event.event_type != EventType::Counter {
            for (key, value) in record.fields().iter() {
                if let Some(name) = key.strip_prefix(ANNOTATION_PREFIX) {
                    let annotation = build_annotation(
                        &mut self.tables,
                        &mut self.ids,
                        &mut interned,
                        name,
                        value,
                    );
                    track_event.debug_annotations.push(annotation);
                }
                if key == "flow_name" {
                    let flow_id = self.flow_id_for(&text(value));
                    track_event.flow_ids.push(flow_id);
                }
            }
        }

        if let Some((body, priority)) = event.log {
            let (body_iid, _) = self.tables.intern_string(
                &mut self.ids,
                &mut interned,
                StringKind::LogMessageBody,
                &body,
            );
            let mut log = LogMessage::default();
            log.set_body_iid(body_iid);
            log.set_prio(priority);
            track_event.log_message = Some(log).into();
        }

        let mut packet = TracePacket::default();
        packet.set_timestamp(event.ts);
        packet.set_track_event(track_event);
        attach_interned(&mut packet, interned);
        self.push_packet(packet);
        Ok(None)
    }

    fn flow_id_for(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.flows.get(name) {
            return id;
        }
        let id = self.ids.next_flow_id();
        self.flows.insert(name.to_string(), id);
        id
    }

    fn check_call_stack<'a>(&self, record: &'a RawRecord) -> Result<CheckedSample<'a>> {
        if record.len() < 7 {
            return Err(EncodeError::FieldCount {
                record: CALL_STACK,
                expected: "at least 7",
                got: record.len(),
            });
        }

        let fields = record.fields();
        let ts = fields.require_u64(CALL_STACK, "ts")?;
        let pid = sample_id(fields, "pid")?;
        let tid = sample_id(fields, "tid")?;
        let cpu = fields
            .get("cpu")
            .map(|cpu| value_as_u32("cpu", cpu))
            .transpose()?;

        Ok(CheckedSample {
            ts,
            pid,
            tid,
            cpu,
            thread_name: thread_name(fields),
            kernel: optional_str(fields, "kstack")?,
            user: optional_str(fields, "ustack")?,
        })
    }

    // ("call_stack", "ts", nsecs, "pid", pid, "tid", tid, "cpu", cpu, "kstack", kstack, "ustack", ustack)
    fn encode_call_stack(&mut self, record: &RawRecord) -> Result<Option<Encoded>> {
        let sample = self.check_call_stack(record)?;

        let track = self.tracks.ensure_thread_track(
            &mut self.ids,
            sample.pid,
            sample.tid,
            &sample.thread_name,
        );
        self.push_track(track);

        let mut interned = InternedData::default();
        if !self.mapping_emitted {
            let mut mapping = Mapping::default();
            mapping.set_iid(DUMMY_MAPPING_IID);
            interned.mappings.push(mapping);
            self.mapping_emitted = true;
        }

        let mut perf_sample = PerfSample::default();
        perf_sample.set_cpu_mode(CpuMode::MODE_USER);
        perf_sample.set_pid(sample.pid.unsigned_abs());
        perf_sample.set_tid(sample.tid.unsigned_abs());
        if let Some(cpu) = sample.cpu {
            perf_sample.set_cpu(cpu);
        }

        let callstack_iid = callstack::encode_sample(
            &mut self.tables,
            &mut self.ids,
            &mut interned,
            sample.kernel,
            sample.user,
        );
        if let Some(iid) = callstack_iid {
            perf_sample.set_callstack_iid(iid);
        }

        let mut packet = TracePacket::default();
        packet.set_timestamp(sample.ts);
        packet.set_perf_sample(perf_sample);
        attach_interned(&mut packet, interned);
        self.push_packet(packet);
        Ok(None)
    }
}
