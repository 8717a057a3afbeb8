//! Cooldown-gated arrival recording.

use crate::config::CooldownScope;
use crate::roster::Roster;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patrol_core::{ArrivalEvent, ArrivalSink, Zone};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum SuppressReason {
    /// Not a member of the loaded roster.
    UnknownIdentity,
    /// Last recorded arrival is still inside the window.
    Cooldown { last_recorded_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(ArrivalEvent),
    Suppressed(SuppressReason),
    /// The sink rejected the write. Logged, not raised; the cooldown is left
    /// untouched so a later sighting can try again.
    WriteFailed,
}

impl RecordOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    identity_id: String,
    zone_id: Option<i64>,
}

/// Emits at most one arrival per cooldown key per window.
///
/// The cooldown check, the sink write, and the cooldown update happen under
/// one lock, so concurrent workers cannot both pass the check for the same
/// guard.
pub struct PatrolRecorder {
    roster: Arc<Roster>,
    sink: Arc<dyn ArrivalSink>,
    window: chrono::Duration,
    scope: CooldownScope,
    last_recorded: Mutex<HashMap<CooldownKey, DateTime<Utc>>>,
    recorded: AtomicU64,
}

impl PatrolRecorder {
    pub fn new(
        roster: Arc<Roster>,
        sink: Arc<dyn ArrivalSink>,
        window: std::time::Duration,
        scope: CooldownScope,
    ) -> Self {
        Self {
            roster,
            sink,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            scope,
            last_recorded: Mutex::new(HashMap::new()),
            recorded: AtomicU64::new(0),
        }
    }

    pub fn record(&self, identity_id: &str, zone: &Zone, now: DateTime<Utc>) -> RecordOutcome {
        let Some(identity) = self.roster.get(identity_id) else {
            tracing::debug!(identity = %identity_id, zone = zone.id, "unknown identity, not recorded");
            return RecordOutcome::Suppressed(SuppressReason::UnknownIdentity);
        };

        let key = CooldownKey {
            identity_id: identity_id.to_string(),
            zone_id: match self.scope {
                CooldownScope::Identity => None,
                CooldownScope::IdentityZone => Some(zone.id),
            },
        };

        let mut last_recorded = self.last_recorded.lock();
        if let Some(&last) = last_recorded.get(&key) {
            if now - last < self.window {
                tracing::debug!(
                    identity = %identity_id,
                    zone = zone.id,
                    last = %last,
                    "within cooldown, not recorded"
                );
                return RecordOutcome::Suppressed(SuppressReason::Cooldown {
                    last_recorded_at: last,
                });
            }
        }

        let event = ArrivalEvent {
            identity_id: identity_id.to_string(),
            zone_id: zone.id,
            timestamp: now,
        };
        if let Err(e) = self.sink.insert_arrival(&event) {
            tracing::error!(identity = %identity_id, zone = zone.id, error = %e, "failed to write arrival");
            return RecordOutcome::WriteFailed;
        }
        last_recorded.insert(key, now);
        drop(last_recorded);

        self.recorded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            identity = %identity_id,
            name = %identity.display_name,
            zone = %zone.name,
            zone_id = zone.id,
            at = %now,
            "arrival recorded"
        );
        RecordOutcome::Recorded(event)
    }

    /// Arrivals written since startup.
    pub fn recorded_count(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{identity, zone, FailingSink, MemorySink};
    use chrono::{Duration, TimeZone};

    const WINDOW: std::time::Duration = std::time::Duration::from_secs(300);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn recorder(sink: Arc<dyn ArrivalSink>, scope: CooldownScope) -> PatrolRecorder {
        let roster = Roster::from_identities(vec![identity("G1", &[1.0, 0.0]), identity("G2", &[0.0, 1.0])]);
        PatrolRecorder::new(Arc::new(roster), sink, WINDOW, scope)
    }

    #[test]
    fn test_second_call_inside_window_suppressed() {
        let sink = Arc::new(MemorySink::default());
        let rec = recorder(sink.clone(), CooldownScope::Identity);
        let z1 = zone(1, 100.0, 100.0, 50.0);

        assert!(rec.record("G1", &z1, t0()).is_recorded());
        let second = rec.record("G1", &z1, t0() + Duration::seconds(299));
        assert_eq!(
            second,
            RecordOutcome::Suppressed(SuppressReason::Cooldown { last_recorded_at: t0() })
        );
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_call_at_window_boundary_recorded() {
        let sink = Arc::new(MemorySink::default());
        let rec = recorder(sink.clone(), CooldownScope::Identity);
        let z1 = zone(1, 100.0, 100.0, 50.0);

        assert!(rec.record("G1", &z1, t0()).is_recorded());
        assert!(rec.record("G1", &z1, t0() + Duration::seconds(300)).is_recorded());
        assert_eq!(sink.events().len(), 2);
        assert_eq!(rec.recorded_count(), 2);
    }

    #[test]
    fn test_identity_scope_spans_zones() {
        let sink = Arc::new(MemorySink::default());
        let rec = recorder(sink.clone(), CooldownScope::Identity);
        assert!(rec.record("G1", &zone(1, 0.0, 0.0, 50.0), t0()).is_recorded());
        assert!(!rec
            .record("G1", &zone(2, 500.0, 0.0, 50.0), t0() + Duration::seconds(10))
            .is_recorded());
        assert!(rec
            .record("G2", &zone(2, 500.0, 0.0, 50.0), t0() + Duration::seconds(10))
            .is_recorded());
    }

    #[test]
    fn test_identity_zone_scope_records_each_zone() {
        let sink = Arc::new(MemorySink::default());
        let rec = recorder(sink.clone(), CooldownScope::IdentityZone);
        assert!(rec.record("G1", &zone(1, 0.0, 0.0, 50.0), t0()).is_recorded());
        assert!(rec
            .record("G1", &zone(2, 500.0, 0.0, 50.0), t0() + Duration::seconds(10))
            .is_recorded());
        assert!(!rec
            .record("G1", &zone(1, 0.0, 0.0, 50.0), t0() + Duration::seconds(20))
            .is_recorded());
    }

    #[test]
    fn test_unknown_identity_suppressed() {
        let sink = Arc::new(MemorySink::default());
        let rec = recorder(sink.clone(), CooldownScope::Identity);
        assert_eq!(
            rec.record("G404", &zone(1, 0.0, 0.0, 50.0), t0()),
            RecordOutcome::Suppressed(SuppressReason::UnknownIdentity)
        );
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_write_failure_leaves_cooldown_open() {
        let rec = recorder(Arc::new(FailingSink), CooldownScope::Identity);
        let z1 = zone(1, 0.0, 0.0, 50.0);
        assert_eq!(rec.record("G1", &z1, t0()), RecordOutcome::WriteFailed);
        assert_eq!(
            rec.record("G1", &z1, t0() + Duration::seconds(1)),
            RecordOutcome::WriteFailed,
            "a failed write must not start a cooldown"
        );
        assert_eq!(rec.recorded_count(), 0);
    }

    #[test]
    fn test_concurrent_records_emit_once() {
        let sink = Arc::new(MemorySink::default());
        let rec = recorder(sink.clone(), CooldownScope::Identity);
        let z1 = zone(1, 0.0, 0.0, 50.0);

        std::thread::scope(|s| {
            for i in 0..8 {
                let (rec, z1) = (&rec, &z1);
                s.spawn(move || rec.record("G1", z1, t0() + Duration::milliseconds(i)));
            }
        });
        assert_eq!(sink.events().len(), 1);
    }
}
