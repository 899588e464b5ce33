/// Monotonic id counters for a single trace.
///
/// Track uuids, flow ids and interned ids each start at 1. The interned
/// counter is shared by every interned kind (strings, frames, call stacks),
/// which is what lets a frame id be derived from its function name id.
#[derive(Debug, Default)]
pub struct IdRegistry {
    track: u64,
    flow: u64,
    intern: u64,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_track_id(&mut self) -> u64 {
        self.track += 1;
        self.track
    }

    pub fn next_flow_id(&mut self) -> u64 {
        self.flow += 1;
        self.flow
    }

    pub fn next_intern_id(&mut self) -> u64 {
        self.intern += 1;
        self.intern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_one() {
        let mut ids = IdRegistry::new();
        assert_eq!(ids.next_track_id(), 1);
        assert_eq!(ids.next_flow_id(), 1);
        assert_eq!(ids.next_intern_id(), 1);
    }

    #[test]
    fn test_counters_are_independent() {
        let mut ids = IdRegistry::new();
        ids.next_track_id();
        ids.next_track_id();
        ids.next_intern_id();
        assert_eq!(ids.next_track_id(), 3);
        assert_eq!(ids.next_flow_id(), 1);
        assert_eq!(ids.next_intern_id(), 2);
    }
}
