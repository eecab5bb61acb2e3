//! Server-clock offset tracking.
//!
//! Each sync measures the round trip of a `public/get_time` call and
//! estimates the one-way latency as half the round trip. The resulting delta
//! converts between local and server milliseconds exactly in both
//! directions. A failed sync keeps the previous delta.

/// Point-in-time view of the sync state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeSyncInfo {
    pub delta_ms: i64,
    pub synced: bool,
    pub last_sync_local_ms: Option<i64>,
    pub last_round_trip_ms: Option<i64>,
    pub sync_count: u64,
    pub failure_count: u64,
    pub sync_interval_ms: u64,
}

/// Maintains a bounded-error server-clock offset for one connection.
#[derive(Clone, Debug)]
pub struct TimeSync {
    delta_ms: i64,
    synced: bool,
    last_sync_local_ms: Option<i64>,
    last_round_trip_ms: Option<i64>,
    sync_count: u64,
    failure_count: u64,
    sync_interval_ms: u64,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new(crate::common::consts::DEFAULT_TIME_SYNC_INTERVAL_MS)
    }
}

impl TimeSync {
    /// Creates an unsynced service with the given tick period.
    #[must_use]
    pub fn new(sync_interval_ms: u64) -> Self {
        Self {
            delta_ms: 0,
            synced: false,
            last_sync_local_ms: None,
            last_round_trip_ms: None,
            sync_count: 0,
            failure_count: 0,
            sync_interval_ms,
        }
    }

    #[must_use]
    pub fn sync_interval_ms(&self) -> u64 {
        self.sync_interval_ms
    }

    /// Applies one measurement: request sent at `t0_ms`, response observed at
    /// `t1_ms`, server reported `server_ms`.
    pub fn apply_sample(&mut self, t0_ms: i64, t1_ms: i64, server_ms: i64) {
        let latency = (t1_ms - t0_ms) / 2;
        self.delta_ms = (server_ms - latency) - t0_ms;
        self.synced = true;
        self.last_sync_local_ms = Some(t1_ms);
        self.last_round_trip_ms = Some(t1_ms - t0_ms);
        self.sync_count += 1;

        tracing::debug!(
            target: "deribit_client",
            delta_ms = self.delta_ms,
            round_trip_ms = t1_ms - t0_ms,
            "time_sync.success",
        );
    }

    /// Records a failed sync; the previous delta is retained.
    pub fn on_failure(&mut self, reason: &str) {
        self.failure_count += 1;
        tracing::warn!(
            target: "deribit_client",
            reason,
            delta_ms = self.delta_ms,
            "time_sync.failure",
        );
    }

    /// Current offset estimate (server minus local), in milliseconds.
    #[must_use]
    pub fn delta(&self) -> i64 {
        self.delta_ms
    }

    /// Estimated server clock for the given local timestamp.
    #[must_use]
    pub fn server_time(&self, local_now_ms: i64) -> i64 {
        local_now_ms + self.delta_ms
    }

    /// Converts a local timestamp to server time.
    #[must_use]
    pub fn local_to_server(&self, local_ms: i64) -> i64 {
        local_ms + self.delta_ms
    }

    /// Converts a server timestamp to local time.
    #[must_use]
    pub fn server_to_local(&self, server_ms: i64) -> i64 {
        server_ms - self.delta_ms
    }

    #[must_use]
    pub fn sync_info(&self) -> TimeSyncInfo {
        TimeSyncInfo {
            delta_ms: self.delta_ms,
            synced: self.synced,
            last_sync_local_ms: self.last_sync_local_ms,
            last_round_trip_ms: self.last_round_trip_ms,
            sync_count: self.sync_count,
            failure_count: self.failure_count,
            sync_interval_ms: self.sync_interval_ms,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_delta_estimation_compensates_latency() {
        let mut sync = TimeSync::new(300_000);
        // Request at 1_000, response at 1_100 (100 ms round trip), server
        // reports 1_550 at the instant it handled the request.
        sync.apply_sample(1_000, 1_100, 1_550);
        // latency = 50; delta = (1550 - 50) - 1000 = 500.
        assert_eq!(sync.delta(), 500);
        assert_eq!(sync.server_time(2_000), 2_500);
    }

    #[rstest]
    fn test_negative_delta_when_server_behind() {
        let mut sync = TimeSync::new(300_000);
        sync.apply_sample(10_000, 10_020, 9_000);
        assert!(sync.delta() < 0);
        assert_eq!(sync.delta(), (9_000 - 10) - 10_000);
    }

    #[rstest]
    #[case(0)]
    #[case(42)]
    #[case(-42)]
    #[case(1_700_000_000_000)]
    fn test_round_trip_law_exact(#[case] x: i64) {
        let mut sync = TimeSync::new(300_000);
        sync.apply_sample(1_000, 1_137, 999_555);
        assert_eq!(sync.server_to_local(sync.local_to_server(x)), x);
        assert_eq!(sync.local_to_server(sync.server_to_local(x)), x);
    }

    #[rstest]
    fn test_failure_retains_previous_delta() {
        let mut sync = TimeSync::new(300_000);
        sync.apply_sample(1_000, 1_100, 1_550);
        let before = sync.delta();
        sync.on_failure("transport down");
        assert_eq!(sync.delta(), before);

        let info = sync.sync_info();
        assert_eq!(info.sync_count, 1);
        assert_eq!(info.failure_count, 1);
        assert!(info.synced);
    }

    #[rstest]
    fn test_unsynced_defaults() {
        let sync = TimeSync::new(300_000);
        let info = sync.sync_info();
        assert_eq!(info.delta_ms, 0);
        assert!(!info.synced);
        assert_eq!(info.last_sync_local_ms, None);
    }
}
