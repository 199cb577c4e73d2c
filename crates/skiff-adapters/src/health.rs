use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-endpoint connection lifecycle.
///
/// `Disconnected → Connecting → Validated → Active → {Disconnected | Error}`.
/// `Error` is terminal for the session loop until a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Validated,
    Active,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationQuality {
    Good,
    Degraded,
    Poor,
    Offline,
    Disabled,
}

/// Health surface one adapter exposes through the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealth {
    pub state: ConnectionState,
    pub connected: bool,
    pub last_poll: Option<DateTime<Utc>>,
    /// Last successful sample.
    pub last_seen: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub response_time_ms: Option<u64>,
    /// Fraction of recent polling ticks that fully succeeded.
    pub poll_success_rate: f64,
    pub registers_updated: u64,
    pub communication_quality: CommunicationQuality,
    /// Rolling window backing `poll_success_rate`.
    #[serde(skip)]
    window: VecDeque<bool>,
    #[serde(skip)]
    enabled: bool,
}

const WINDOW: usize = 64;

impl AdapterHealth {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            last_poll: None,
            last_seen: None,
            error_count: 0,
            last_error: None,
            response_time_ms: None,
            poll_success_rate: 1.0,
            registers_updated: 0,
            communication_quality: if enabled {
                CommunicationQuality::Offline
            } else {
                CommunicationQuality::Disabled
            },
            window: VecDeque::new(),
            enabled,
        }
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.connected = state == ConnectionState::Active;
        self.recompute_quality();
    }

    pub fn record_error(&mut self, error: &str) {
        self.error_count += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn record_poll(&mut self, fully_succeeded: bool, response_time_ms: u64) {
        self.last_poll = Some(Utc::now());
        self.response_time_ms = Some(response_time_ms);
        if self.window.len() >= WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(fully_succeeded);
        let ok = self.window.iter().filter(|b| **b).count();
        self.poll_success_rate = ok as f64 / self.window.len() as f64;
        self.recompute_quality();
    }

    pub fn record_sample(&mut self) {
        self.last_seen = Some(Utc::now());
        self.registers_updated += 1;
    }

    fn recompute_quality(&mut self) {
        self.communication_quality = if !self.enabled {
            CommunicationQuality::Disabled
        } else if !self.connected {
            CommunicationQuality::Offline
        } else if self.poll_success_rate >= 0.95 {
            CommunicationQuality::Good
        } else if self.poll_success_rate >= 0.70 {
            CommunicationQuality::Degraded
        } else {
            CommunicationQuality::Poor
        };
    }
}
