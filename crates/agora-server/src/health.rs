//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

use agora_relay::migration::MigrationPhase;
use agora_relay::stats::StatsSnapshot;
use agora_relay::PressureLevel;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"draining"` once a migration has started.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Number of live topics.
    pub topics: usize,
    /// Current memory pressure level.
    pub pressure: PressureLevel,
    /// Whether the scale-out backbone is reachable.
    pub backbone_connected: bool,
    /// Current migration phase.
    pub migration_phase: MigrationPhase,
}

/// Build a health response from a relay snapshot.
pub fn health_check(
    start_time: Instant,
    snapshot: &StatsSnapshot,
    phase: MigrationPhase,
) -> HealthResponse {
    let status = if phase == MigrationPhase::Idle {
        "ok"
    } else {
        "draining"
    };
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: snapshot.connections,
        topics: snapshot.topics.len(),
        pressure: snapshot.pressure,
        backbone_connected: snapshot.backbone_connected,
        migration_phase: phase,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use agora_relay::stats::StatsCollector;

    fn snapshot(connections: usize) -> StatsSnapshot {
        StatsCollector::new().snapshot(connections, HashMap::new(), PressureLevel::Normal, 0)
    }

    #[test]
    fn status_is_ok_while_idle() {
        let resp = health_check(Instant::now(), &snapshot(0), MigrationPhase::Idle);
        assert_eq!(resp.status, "ok");
    }

    #[test]
    fn status_is_draining_during_migration() {
        let resp = health_check(Instant::now(), &snapshot(3), MigrationPhase::Draining);
        assert_eq!(resp.status, "draining");
        assert_eq!(resp.connections, 3);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, &snapshot(0), MigrationPhase::Idle);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), &snapshot(2), MigrationPhase::Idle);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 2);
        assert_eq!(json["pressure"], "normal");
        assert_eq!(json["migration_phase"], "idle");
        assert!(json["uptime_secs"].is_number());
    }
}
