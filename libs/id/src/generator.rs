//! Monotonic event ID generation.

use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use ulid::Generator;

use crate::InstanceEventId;

/// Hands out strictly increasing [`InstanceEventId`]s.
///
/// Within one millisecond the random part is incremented instead of
/// re-rolled, so ordering by ID matches ordering by creation. If the random
/// part would overflow, generation waits for the next millisecond.
pub struct EventIdGenerator {
    inner: Mutex<Generator>,
}

impl EventIdGenerator {
    /// Creates an independent generator.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Process-wide generator shared by every instance event log.
    pub fn global() -> &'static EventIdGenerator {
        static GLOBAL: OnceLock<EventIdGenerator> = OnceLock::new();
        GLOBAL.get_or_init(EventIdGenerator::new)
    }

    /// Returns the next ID.
    pub fn next_id(&self) -> InstanceEventId {
        let mut generator = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match generator.generate() {
                Ok(ulid) => return InstanceEventId::from_ulid(ulid),
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Returns the next ID, guaranteed to be greater than `floor`.
    ///
    /// `floor` is the last ID persisted before a restart. A clock that moved
    /// backwards would otherwise mint IDs that sort before it.
    pub fn next_after(&self, floor: Option<InstanceEventId>) -> InstanceEventId {
        let id = self.next_id();
        match floor {
            Some(floor) if id <= floor => floor
                .ulid()
                .increment()
                .map(InstanceEventId::from_ulid)
                .unwrap_or(id),
            _ => id,
        }
    }
}

impl Default for EventIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ids_strictly_increase_within_millisecond() {
        let generator = EventIdGenerator::new();
        let ids: Vec<_> = (0..1000).map(|_| generator.next_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_next_after_future_floor() {
        let generator = EventIdGenerator::new();
        let far_future = ulid::Ulid::from_parts(u64::from(u32::MAX) * 1000, 7);
        let floor = InstanceEventId::from_ulid(far_future);
        let id = generator.next_after(Some(floor));
        assert!(id > floor);
    }

    proptest! {
        #[test]
        fn prop_next_after_exceeds_floor(ts in 0u64..(1u64 << 47), rand in 0u128..(1u128 << 79)) {
            let generator = EventIdGenerator::new();
            let floor = InstanceEventId::from_ulid(ulid::Ulid::from_parts(ts, rand));
            prop_assert!(generator.next_after(Some(floor)) > floor);
        }
    }
}
