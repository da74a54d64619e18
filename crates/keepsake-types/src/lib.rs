use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Store-assigned record identifier. Monotonic, never reused.
pub type RecordId = i64;

/// Label prefix shared by every interaction-log kind.
pub const INTERACTION_PREFIX: &str = "interaction_";

const CONVERSATION_LABEL: &str = "conversation";

// ─────────────────────────────────────────────────────────────────────────────
// Importance
// ─────────────────────────────────────────────────────────────────────────────

/// Priority score of a record, always within `[1, 100]`.
///
/// Every constructor and arithmetic helper clamps, so an out-of-range value
/// can never be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub struct Importance(u8);

impl Importance {
    pub const MIN: Importance = Importance(1);
    pub const MAX: Importance = Importance(100);
    /// Baseline score for a record with no distinguishing features.
    pub const NEUTRAL: Importance = Importance(50);

    /// Build an importance from any integer, clamping into `[1, 100]`.
    pub const fn new(value: i64) -> Self {
        let clamped = if value < 1 {
            1
        } else if value > 100 {
            100
        } else {
            value
        };
        Importance(clamped as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Add `delta` (which may be negative) and clamp the result.
    pub fn adjust(self, delta: i64) -> Self {
        Importance::new(i64::from(self.0) + delta)
    }
}

impl Default for Importance {
    fn default() -> Self {
        Importance::NEUTRAL
    }
}

impl From<i64> for Importance {
    fn from(value: i64) -> Self {
        Importance::new(value)
    }
}

impl From<Importance> for i64 {
    fn from(value: Importance) -> Self {
        i64::from(value.0)
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryKind
// ─────────────────────────────────────────────────────────────────────────────

/// Direction of a logged message exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// A message received from the user.
    Receive,
    /// A message sent by the agent.
    Send,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Receive => "receive",
            Direction::Send => "send",
        }
    }
}

/// Errors raised when a kind label cannot be used for a new record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KindError {
    #[error("event kind must not be empty")]
    Empty,
    #[error("event kind '{0}' is reserved")]
    Reserved(String),
}

/// What a record remembers: a conversational exchange, a logged interaction,
/// or any other named event (`"system"`, `"life_event"`, …).
///
/// Persisted as a plain label so prefix queries such as `interaction_` work
/// directly against the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemoryKind {
    Conversation,
    Interaction(Direction),
    Event(String),
}

impl MemoryKind {
    /// Build an event kind, rejecting labels that would read back as one of
    /// the built-in kinds.
    pub fn event(label: impl Into<String>) -> Result<Self, KindError> {
        let label = label.into();
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return Err(KindError::Empty);
        }
        if trimmed == CONVERSATION_LABEL || trimmed.starts_with(INTERACTION_PREFIX) {
            return Err(KindError::Reserved(trimmed.to_string()));
        }
        Ok(MemoryKind::Event(trimmed.to_string()))
    }

    /// Decode a stored label. Unknown labels become [`MemoryKind::Event`].
    pub fn from_label(label: &str) -> Result<Self, KindError> {
        match label {
            CONVERSATION_LABEL => Ok(MemoryKind::Conversation),
            "interaction_receive" => Ok(MemoryKind::Interaction(Direction::Receive)),
            "interaction_send" => Ok(MemoryKind::Interaction(Direction::Send)),
            other => MemoryKind::event(other),
        }
    }

    pub fn label(&self) -> String {
        match self {
            MemoryKind::Conversation => CONVERSATION_LABEL.to_string(),
            MemoryKind::Interaction(dir) => format!("{INTERACTION_PREFIX}{}", dir.as_str()),
            MemoryKind::Event(name) => name.clone(),
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl TryFrom<String> for MemoryKind {
    type Error = KindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MemoryKind::from_label(&value)
    }
}

impl From<MemoryKind> for String {
    fn from(kind: MemoryKind) -> Self {
        kind.label()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Emotional snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Value of an emotion dial that counts as perfectly neutral.
pub const NEUTRAL_DIAL: f32 = 50.0;

/// Point-in-time reading of the agent's emotion dials, each on a `0..=100`
/// scale where 50 is neutral (e.g. `happiness`, `energy`).
///
/// Supplied by the caller at write time; the memory core never reads
/// personality state on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionSnapshot {
    dials: BTreeMap<String, f32>,
}

impl EmotionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter. Values are clamped to `0..=100`.
    pub fn with(mut self, dial: &str, value: f32) -> Self {
        self.set(dial, value);
        self
    }

    /// Set a dial, clamped to `0..=100`. A non-finite reading is not a
    /// reading at all: the dial is left unset.
    pub fn set(&mut self, dial: &str, value: f32) {
        if value.is_finite() {
            self.dials.insert(dial.to_string(), value.clamp(0.0, 100.0));
        } else {
            self.dials.remove(dial);
        }
    }

    pub fn get(&self, dial: &str) -> Option<f32> {
        self.dials.get(dial).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.dials.is_empty()
    }

    /// Whether every dial holds a finite value in `0..=100`. Snapshots built
    /// with [`set`](Self::set) always do; deserialized ones may not.
    pub fn in_range(&self) -> bool {
        self.dials.values().all(|v| (0.0..=100.0).contains(v))
    }

    /// Largest distance of any dial from neutral, normalised to `[0, 1]`.
    pub fn max_deviation(&self) -> f32 {
        self.dials
            .values()
            .map(|v| ((v - NEUTRAL_DIAL).abs() / NEUTRAL_DIAL).min(1.0))
            .fold(0.0, f32::max)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record content and metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Situation captured alongside a conversational exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SituationContext {
    #[serde(default)]
    pub emotion: EmotionSnapshot,
    pub timestamp: DateTime<Utc>,
    /// Transport-level message type (`"text"`, `"photo"`, …).
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Immutable payload of a memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MemoryContent {
    Conversation {
        user: String,
        agent: String,
        context: SituationContext,
    },
    Event {
        payload: Map<String, Value>,
    },
}

impl MemoryContent {
    /// Flatten the content into the free text used for scoring, tagging and
    /// semantic indexing.
    pub fn text(&self) -> String {
        match self {
            MemoryContent::Conversation { user, agent, .. } => format!("{user} {agent}"),
            MemoryContent::Event { payload } => {
                let mut parts = Vec::new();
                for value in payload.values() {
                    collect_strings(value, &mut parts);
                }
                parts.join(" ")
            }
        }
    }

    /// Character count of the textual parts of the content.
    pub fn text_len(&self) -> usize {
        match self {
            MemoryContent::Conversation { user, agent, .. } => {
                user.chars().count() + agent.chars().count()
            }
            MemoryContent::Event { .. } => self.text().chars().count(),
        }
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Auxiliary data captured at write time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionSnapshot>,
    /// Size of the textual content in characters.
    #[serde(default)]
    pub size: usize,
    /// Caller-defined extras (e.g. `recorded_at` for events).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryRecord
// ─────────────────────────────────────────────────────────────────────────────

/// One stored unit of memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub kind: MemoryKind,
    pub content: MemoryContent,
    pub metadata: RecordMetadata,
    pub importance: Importance,
    pub created_at: DateTime<Utc>,
    pub access_count: u32,
    pub last_accessed: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Extracted keywords, at most five, in extraction order.
    pub tags: Vec<String>,
}

impl MemoryRecord {
    /// Whether the record is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Relation
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of a directed link between two records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// The records share extracted keywords.
    Semantic,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Semantic => "semantic",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "semantic" => Some(RelationKind::Semantic),
            _ => None,
        }
    }
}

/// Directed, weighted edge created when `from_id` was written. Either end may
/// have been deleted since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from_id: RecordId,
    pub to_id: RecordId,
    pub kind: RelationKind,
    pub strength: f32,
}
