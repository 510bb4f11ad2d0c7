//! Core domain types for beacon
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Dispatch** | One tracked event: identity, creation time and a key/value payload |
//! | **Dispatcher** | A sink that delivers queued dispatches to a remote endpoint |
//! | **Barrier** | A per-dispatcher gate that must be open for delivery to proceed |
//! | **Scope** | Whether a barrier applies to every dispatcher or to one named dispatcher |
//! | **Acknowledge** | Record that a dispatcher received a dispatch, removing its queue entry |

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Payload key holding the event name of a dispatch.
pub const EVENT_NAME_KEY: &str = "event_name";

/// Key/value payload carried by a [`Dispatch`].
pub type Payload = Map<String, Value>;

// ============================================
// Dispatch
// ============================================

/// One event submitted for tracking.
///
/// `id` and `timestamp` never change. The payload is enriched by collectors
/// and transformers before the dispatch reaches the queue; once stored it is
/// read back verbatim and delivery outcome never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// When the dispatch was created
    pub timestamp: DateTime<Utc>,
    /// Enriched key/value payload
    pub payload: Payload,
}

impl Dispatch {
    /// Create a dispatch for a named event with an empty payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_payload(name, Payload::new())
    }

    /// Create a dispatch for a named event with initial data.
    pub fn with_payload(name: impl Into<String>, mut payload: Payload) -> Self {
        payload.insert(EVENT_NAME_KEY.to_string(), Value::String(name.into()));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            // Stored with millisecond precision
            timestamp: Utc::now().trunc_subsecs(3),
            payload,
        }
    }

    /// Rebuild a dispatch from stored parts.
    pub fn from_parts(id: String, timestamp_ms: i64, payload: Payload) -> Self {
        let timestamp = Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            id,
            timestamp,
            payload,
        }
    }

    /// The event name, if the payload still carries one.
    pub fn name(&self) -> Option<&str> {
        self.payload.get(EVENT_NAME_KEY).and_then(Value::as_str)
    }

    /// Merge additional data into the payload. Existing keys are overwritten.
    pub fn enrich(&mut self, data: Payload) {
        self.payload.extend(data);
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

// ============================================
// Time frames
// ============================================

/// Unit of a [`TimeFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn millis(&self) -> u64 {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        }
    }
}

/// A length of time expressed as `interval` × `unit`, e.g. `{ interval = 1, unit = "days" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFrame {
    pub interval: u64,
    pub unit: TimeUnit,
}

impl TimeFrame {
    pub const fn new(interval: u64, unit: TimeUnit) -> Self {
        Self { interval, unit }
    }

    pub const fn days(interval: u64) -> Self {
        Self::new(interval, TimeUnit::Days)
    }

    pub fn as_millis(&self) -> u64 {
        self.interval.saturating_mul(self.unit.millis())
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.as_millis())
    }

    /// The instant this time frame before `now`.
    pub fn before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let millis = i64::try_from(self.as_millis()).unwrap_or(i64::MAX);
        now.checked_sub_signed(chrono::Duration::milliseconds(millis))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

// ============================================
// Module storage expiry
// ============================================

/// Lifetime of a value stored in module key/value storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Removed when the current session ends
    Session,
    /// Removed the next time the store is opened
    UntilRestart,
    /// Never removed automatically
    Forever,
    /// Removed once this instant has passed
    At(DateTime<Utc>),
}

impl Expiry {
    const FOREVER: i64 = -1;
    const SESSION: i64 = -2;
    const UNTIL_RESTART: i64 = -3;

    /// Integer encoding used by the `expiry` column.
    pub fn to_column(&self) -> i64 {
        match self {
            Expiry::Forever => Self::FOREVER,
            Expiry::Session => Self::SESSION,
            Expiry::UntilRestart => Self::UNTIL_RESTART,
            Expiry::At(at) => at.timestamp_millis().max(0),
        }
    }

    pub fn from_column(value: i64) -> Self {
        match value {
            Self::SESSION => Expiry::Session,
            Self::UNTIL_RESTART => Expiry::UntilRestart,
            v if v >= 0 => Utc
                .timestamp_millis_opt(v)
                .single()
                .map(Expiry::At)
                .unwrap_or(Expiry::Forever),
            _ => Expiry::Forever,
        }
    }

    /// Whether an `At` expiry has passed. Other variants never expire by time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Expiry::At(at) if *at <= now)
    }
}

// ============================================
// Application lifecycle
// ============================================

/// Foreground/background status of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Initialized,
    Foreground,
    Background,
}
