use std::collections::HashMap;

use perfetto_protos::counter_descriptor::counter_descriptor::Unit;
use perfetto_protos::counter_descriptor::CounterDescriptor;
use perfetto_protos::thread_descriptor::ThreadDescriptor;
use perfetto_protos::track_descriptor::TrackDescriptor;

use crate::error::{EncodeError, Result};
use crate::ids::IdRegistry;

/// Thread name used when a thread track is created from an event that does
/// not carry one.
pub const UNKNOWN_THREAD_NAME: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUnit {
    Unspecified,
    Count,
    SizeBytes,
    TimeNs,
}

impl CounterUnit {
    pub const VALID: &'static str = "unspecified, count, size_bytes, time_ns";

    pub fn parse(unit: &str) -> Result<Self> {
        match unit {
            "unspecified" => Ok(CounterUnit::Unspecified),
            "count" => Ok(CounterUnit::Count),
            "size_bytes" => Ok(CounterUnit::SizeBytes),
            "time_ns" => Ok(CounterUnit::TimeNs),
            _ => Err(EncodeError::InvalidEnum {
                key: "unit",
                value: unit.to_string(),
                valid: Self::VALID,
            }),
        }
    }
}

impl From<CounterUnit> for Unit {
    fn from(unit: CounterUnit) -> Self {
        match unit {
            CounterUnit::Unspecified => Unit::UNIT_UNSPECIFIED,
            CounterUnit::Count => Unit::UNIT_COUNT,
            CounterUnit::SizeBytes => Unit::UNIT_SIZE_BYTES,
            CounterUnit::TimeNs => Unit::UNIT_TIME_NS,
        }
    }
}

/// Result of asking for a track: its uuid, plus the descriptor to emit if the
/// track did not exist before.
#[derive(Debug)]
pub struct EnsuredTrack {
    pub uuid: u64,
    pub descriptor: Option<TrackDescriptor>,
}

impl EnsuredTrack {
    fn existing(uuid: u64) -> Self {
        Self {
            uuid,
            descriptor: None,
        }
    }

    fn created(descriptor: TrackDescriptor) -> Self {
        Self {
            uuid: descriptor.uuid(),
            descriptor: Some(descriptor),
        }
    }
}

/// Caches one descriptor per track name and per (pid, tid).
///
/// Named and counter tracks share the name namespace, so a counter can be the
/// parent of a named track and vice versa.
#[derive(Debug, Default)]
pub struct TrackManager {
    names: HashMap<String, u64>,
    threads: HashMap<(i32, i32), u64>,
}

impl TrackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_named_track(&self, name: &str) -> Option<u64> {
        self.names.get(name).copied()
    }

    pub fn lookup_thread_track(&self, pid: i32, tid: i32) -> Option<u64> {
        self.threads.get(&(pid, tid)).copied()
    }

    pub fn ensure_named_track(
        &mut self,
        ids: &mut IdRegistry,
        name: &str,
        parent: Option<&str>,
    ) -> Result<EnsuredTrack> {
        if let Some(uuid) = self.lookup_named_track(name) {
            return Ok(EnsuredTrack::existing(uuid));
        }

        let parent_uuid = match parent {
            Some(parent) => Some(
                self.lookup_named_track(parent)
                    .ok_or_else(|| EncodeError::UnknownParent(parent.to_string()))?,
            ),
            None => None,
        };

        let mut desc = TrackDescriptor::default();
        desc.set_uuid(ids.next_track_id());
        desc.set_name(name.to_string());
        if let Some(parent_uuid) = parent_uuid {
            desc.set_parent_uuid(parent_uuid);
        }

        self.names.insert(name.to_string(), desc.uuid());
        Ok(EnsuredTrack::created(desc))
    }

    pub fn ensure_thread_track(
        &mut self,
        ids: &mut IdRegistry,
        pid: i32,
        tid: i32,
        thread_name: &str,
    ) -> EnsuredTrack {
        if let Some(uuid) = self.lookup_thread_track(pid, tid) {
            return EnsuredTrack::existing(uuid);
        }

        let mut thread = ThreadDescriptor::default();
        thread.set_pid(pid);
        thread.set_tid(tid);
        thread.set_thread_name(thread_name.to_string());

        let mut desc = TrackDescriptor::default();
        desc.set_uuid(ids.next_track_id());
        desc.thread = Some(thread).into();

        self.threads.insert((pid, tid), desc.uuid());
        EnsuredTrack::created(desc)
    }

    pub fn ensure_counter_track(
        &mut self,
        ids: &mut IdRegistry,
        name: &str,
        unit: CounterUnit,
    ) -> EnsuredTrack {
        if let Some(uuid) = self.lookup_named_track(name) {
            return EnsuredTrack::existing(uuid);
        }

        let mut counter_desc = CounterDescriptor::default();
        counter_desc.set_unit(unit.into());

        let mut desc = TrackDescriptor::default();
        desc.set_uuid(ids.next_track_id());
        desc.set_name(name.to_string());
        desc.counter = Some(counter_desc).into();

        self.names.insert(name.to_string(), desc.uuid());
        EnsuredTrack::created(desc)
    }

    pub fn len(&self) -> usize {
        self.names.len() + self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_track_is_created_once() {
        let mut ids = IdRegistry::new();
        let mut tracks = TrackManager::new();

        let first = tracks.ensure_named_track(&mut ids, "Top", None).unwrap();
        let desc = first.descriptor.as_ref().unwrap();
        assert_eq!(first.uuid, 1);
        assert_eq!(desc.name(), "Top");
        assert!(!desc.has_parent_uuid());

        let again = tracks.ensure_named_track(&mut ids, "Top", None).unwrap();
        assert_eq!(again.uuid, 1);
        assert!(again.descriptor.is_none());
    }

    #[test]
    fn test_named_track_parent_is_resolved() {
        let mut ids = IdRegistry::new();
        let mut tracks = TrackManager::new();

        tracks.ensure_named_track(&mut ids, "Top", None).unwrap();
        let child = tracks
            .ensure_named_track(&mut ids, "Child", Some("Top"))
            .unwrap();
        assert_eq!(child.uuid, 2);
        assert_eq!(child.descriptor.unwrap().parent_uuid(), 1);
    }

    #[test]
    fn test_unknown_parent_allocates_nothing() {
        let mut ids = IdRegistry::new();
        let mut tracks = TrackManager::new();

        let err = tracks
            .ensure_named_track(&mut ids, "Child", Some("Missing"))
            .unwrap_err();
        assert_eq!(err, EncodeError::UnknownParent("Missing".to_string()));
        assert!(tracks.is_empty());
        assert_eq!(ids.next_track_id(), 1);
    }

    #[test]
    fn test_thread_track_keyed_by_pid_tid() {
        let mut ids = IdRegistry::new();
        let mut tracks = TrackManager::new();

        let a = tracks.ensure_thread_track(&mut ids, 100, 200, "worker");
        let thread = a.descriptor.as_ref().unwrap().thread.as_ref().unwrap();
        assert_eq!(thread.pid(), 100);
        assert_eq!(thread.tid(), 200);
        assert_eq!(thread.thread_name(), "worker");

        let b = tracks.ensure_thread_track(&mut ids, 100, 201, "worker");
        let again = tracks.ensure_thread_track(&mut ids, 100, 200, "renamed");
        assert_ne!(a.uuid, b.uuid);
        assert_eq!(again.uuid, a.uuid);
        assert!(again.descriptor.is_none());
        assert_eq!(tracks.lookup_thread_track(100, 201), Some(b.uuid));
    }

    #[test]
    fn test_counter_track_unit() {
        let mut ids = IdRegistry::new();
        let mut tracks = TrackManager::new();

        let counter = tracks.ensure_counter_track(&mut ids, "faults", CounterUnit::SizeBytes);
        let desc = counter.descriptor.unwrap();
        assert_eq!(desc.name(), "faults");
        assert_eq!(desc.counter.unit(), Unit::UNIT_SIZE_BYTES);
        assert_eq!(tracks.lookup_named_track("faults"), Some(counter.uuid));
    }

    #[test]
    fn test_counter_unit_parsing() {
        assert_eq!(CounterUnit::parse("count").unwrap(), CounterUnit::Count);
        assert_eq!(CounterUnit::parse("time_ns").unwrap(), CounterUnit::TimeNs);
        assert!(matches!(
            CounterUnit::parse("sized_bytes"),
            Err(EncodeError::InvalidEnum { key: "unit", .. })
        ));
    }
}
