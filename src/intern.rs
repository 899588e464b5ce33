use std::collections::HashMap;

use perfetto_protos::debug_annotation::DebugAnnotationName;
use perfetto_protos::interned_data::InternedData;
use perfetto_protos::log_message::LogMessageBody;
use perfetto_protos::profile_common::{Callstack, Frame, InternedString};
use perfetto_protos::track_event::EventName;

use crate::ids::IdRegistry;

/// Every frame points at this mapping, which is emitted once with the first
/// perf sample.
pub const DUMMY_MAPPING_IID: u64 = 1;

/// The interned-data table a string lands in.
///
/// Each kind has its own dedup table, but all of them draw ids from the
/// shared interned counter in [`IdRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringKind {
    EventName,
    DebugAnnotationName,
    DebugAnnotationStringValue,
    FunctionName,
    LogMessageBody,
}

impl StringKind {
    fn emit(&self, interned: &mut InternedData, iid: u64, value: &str) {
        match self {
            StringKind::EventName => {
                let mut name = EventName::default();
                name.set_iid(iid);
                name.set_name(value.to_string());
                interned.event_names.push(name);
            }
            StringKind::DebugAnnotationName => {
                let mut name = DebugAnnotationName::default();
                name.set_iid(iid);
                name.set_name(value.to_string());
                interned.debug_annotation_names.push(name);
            }
            StringKind::DebugAnnotationStringValue => {
                interned
                    .debug_annotation_string_values
                    .push(interned_bytes(iid, value));
            }
            StringKind::FunctionName => {
                interned.function_names.push(interned_bytes(iid, value));
            }
            StringKind::LogMessageBody => {
                let mut body = LogMessageBody::default();
                body.set_iid(iid);
                body.set_body(value.to_string());
                interned.log_message_body.push(body);
            }
        }
    }
}

fn interned_bytes(iid: u64, value: &str) -> InternedString {
    let mut interned = InternedString::default();
    interned.set_iid(iid);
    interned.set_str(value.as_bytes().to_vec());
    interned
}

/// Content-keyed caches of everything interned into the trace so far.
///
/// New entries are appended to the `InternedData` of the packet being built,
/// so each value is written exactly once, in the first packet that uses it.
#[derive(Debug, Default)]
pub struct InternTables {
    strings: HashMap<StringKind, HashMap<String, u64>>,
    callstacks: HashMap<Vec<u64>, u64>,
}

impl InternTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the iid for `value` and whether this call added it.
    pub fn intern_string(
        &mut self,
        ids: &mut IdRegistry,
        interned: &mut InternedData,
        kind: StringKind,
        value: &str,
    ) -> (u64, bool) {
        let table = self.strings.entry(kind).or_default();
        if let Some(&iid) = table.get(value) {
            return (iid, false);
        }

        let iid = ids.next_intern_id();
        table.insert(value.to_string(), iid);
        kind.emit(interned, iid, value);
        (iid, true)
    }

    /// Returns the frame iid for a function name.
    ///
    /// The frame id is allocated right after its function name id and is never
    /// stored: a known function name maps to `name_iid + 1`.
    pub fn intern_frame(
        &mut self,
        ids: &mut IdRegistry,
        interned: &mut InternedData,
        function_name: &str,
    ) -> u64 {
        let (name_iid, added) =
            self.intern_string(ids, interned, StringKind::FunctionName, function_name);
        if !added {
            return name_iid + 1;
        }

        let iid = ids.next_intern_id();
        let mut frame = Frame::default();
        frame.set_iid(iid);
        frame.set_function_name_id(name_iid);
        frame.set_mapping_id(DUMMY_MAPPING_IID);
        interned.frames.push(frame);
        iid
    }

    /// Returns the callstack iid for frames listed root-first.
    ///
    /// Stored frame ids are reversed so the callstack reads leaf-first.
    pub fn intern_callstack(
        &mut self,
        ids: &mut IdRegistry,
        interned: &mut InternedData,
        frame_ids: &[u64],
    ) -> u64 {
        if let Some(&iid) = self.callstacks.get(frame_ids) {
            return iid;
        }

        let iid = ids.next_intern_id();
        self.callstacks.insert(frame_ids.to_vec(), iid);

        let mut callstack = Callstack::default();
        callstack.set_iid(iid);
        callstack.frame_ids = frame_ids.iter().rev().copied().collect();
        interned.callstacks.push(callstack);
        iid
    }

    #[cfg(test)]
    pub fn string_count(&self, kind: StringKind) -> usize {
        self.strings.get(&kind).map_or(0, |table| table.len())
    }

    #[cfg(test)]
    pub fn callstack_count(&self) -> usize {
        self.callstacks.len()
    }
}
