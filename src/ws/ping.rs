//! Liveness strategies.
//!
//! Three interchangeable ping handlers share one small surface: an external
//! scheduler drives `on_tick`, the receive path reports `notify_activity` on
//! every inbound header and `notify_pong` when a pong arrives. Handlers are
//! pure state machines over atomics; the connection engine executes the
//! action a tick returns, which keeps the I/O and its locking in one place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::ws::close::CloseReason;
use crate::ws::LockTimeout;

/// Liveness strategy selected at connection construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingMode {
    /// Payload and cadence are supplied by external code.
    Manual,
    /// Timestamped pings measure round trip latency and detect dead peers.
    #[default]
    LatencyControl,
    /// Empty pings, sent only when the connection has gone quiet.
    BandwidthSaving,
}

/// What the engine should do for one ping tick.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PingAction {
    Skip,
    /// Peer is considered dead; tear the connection down.
    Dispose,
    /// Initiate a graceful close with the given reason.
    Close(CloseReason),
    Send {
        payload: PingPayload,
        lock: LockTimeout,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PingPayload {
    /// Current time in nanos, 8 bytes little-endian.
    Timestamp,
    /// Whatever was last staged through `Connection::ping`.
    Staged,
    Empty,
}

#[derive(Debug)]
pub(crate) enum PingHandler {
    Manual(ManualPing),
    LatencyControl(LatencyPing),
    BandwidthSaving(BandwidthPing),
}

impl PingHandler {
    pub fn new(mode: PingMode, interval: Duration, timeout: Option<Duration>, now: u64) -> Self {
        let interval = interval.as_nanos() as u64;
        let timeout = timeout.map(|t| t.as_nanos() as u64);
        match mode {
            PingMode::Manual => PingHandler::Manual(ManualPing {
                timeout,
                last_pong: AtomicU64::new(now),
            }),
            PingMode::LatencyControl => PingHandler::LatencyControl(LatencyPing {
                interval,
                timeout,
                last_activity: AtomicU64::new(now),
            }),
            PingMode::BandwidthSaving => PingHandler::BandwidthSaving(BandwidthPing {
                interval,
                last_activity: AtomicU64::new(now),
            }),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, PingHandler::Manual(_))
    }

    pub fn on_tick(&self, now: u64) -> PingAction {
        match self {
            PingHandler::Manual(manual) => manual.on_tick(now),
            PingHandler::LatencyControl(latency) => latency.on_tick(now),
            PingHandler::BandwidthSaving(bandwidth) => bandwidth.on_tick(now),
        }
    }

    /// Reports inbound traffic. Called on every inbound header receipt.
    pub fn notify_activity(&self, now: u64) {
        match self {
            PingHandler::Manual(_) => {}
            PingHandler::LatencyControl(latency) => latency.last_activity.store(now, Ordering::Release),
            PingHandler::BandwidthSaving(bandwidth) => bandwidth.last_activity.store(now, Ordering::Release),
        }
    }

    /// Reports a received pong payload. Returns a new latency measurement in
    /// nanos when the strategy produces one.
    pub fn notify_pong(&self, payload: &[u8], now: u64) -> Option<u64> {
        match self {
            PingHandler::Manual(manual) => {
                manual.last_pong.store(now, Ordering::Release);
                None
            }
            PingHandler::LatencyControl(latency) => latency.notify_pong(payload, now),
            PingHandler::BandwidthSaving(_) => None,
        }
    }
}

/// External code stages the payload; the handler only watches for pongs going
/// missing and asks for a graceful close when they do.
#[derive(Debug)]
pub(crate) struct ManualPing {
    timeout: Option<u64>,
    last_pong: AtomicU64,
}

impl ManualPing {
    fn on_tick(&self, now: u64) -> PingAction {
        let silent = now.saturating_sub(self.last_pong.load(Ordering::Acquire));
        if let Some(timeout) = self.timeout {
            if silent > timeout {
                return PingAction::Close(CloseReason::GoingAway);
            }
        }
        PingAction::Send {
            payload: PingPayload::Staged,
            lock: LockTimeout::Infinite,
        }
    }
}

/// Sends the current timestamp as the ping payload and halves the echo delta
/// into a round trip latency estimate. A peer silent past the timeout is
/// considered dead and the connection disposed.
#[derive(Debug)]
pub(crate) struct LatencyPing {
    interval: u64,
    timeout: Option<u64>,
    last_activity: AtomicU64,
}

impl LatencyPing {
    fn on_tick(&self, now: u64) -> PingAction {
        let idle = now.saturating_sub(self.last_activity.load(Ordering::Acquire));
        if let Some(timeout) = self.timeout {
            if idle > timeout {
                return PingAction::Dispose;
            }
        }
        // while traffic is flowing the ping is best effort only; skip rather
        // than queue behind a busy writer
        let lock = if idle < self.interval {
            LockTimeout::NoWait
        } else {
            LockTimeout::Infinite
        };
        PingAction::Send {
            payload: PingPayload::Timestamp,
            lock,
        }
    }

    fn notify_pong(&self, payload: &[u8], now: u64) -> Option<u64> {
        if payload.len() < 8 {
            return None;
        }
        let echoed = u64::from_le_bytes(payload[..8].try_into().expect("eight timestamp bytes"));
        Some(now.saturating_sub(echoed) / 2)
    }
}

/// Empty pings, and none at all while inbound traffic already proves the peer
/// alive.
#[derive(Debug)]
pub(crate) struct BandwidthPing {
    interval: u64,
    last_activity: AtomicU64,
}

impl BandwidthPing {
    fn on_tick(&self, now: u64) -> PingAction {
        let idle = now.saturating_sub(self.last_activity.load(Ordering::Acquire));
        if idle < self.interval {
            return PingAction::Skip;
        }
        PingAction::Send {
            payload: PingPayload::Empty,
            lock: LockTimeout::Infinite,
        }
    }
}
