//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
    /// Sessions with at least one subscribed connection.
    pub rooms: usize,
    /// Session actors currently running.
    pub active_actors: usize,
}

pub fn health_check(start_time: Instant, connections: usize, rooms: usize, active_actors: usize) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        rooms,
        active_actors,
    }
}
