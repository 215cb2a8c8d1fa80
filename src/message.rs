//! Chat message model — the unit everything in scopechat synchronizes.
//!
//! DESIGN
//! ======
//! A `ChatMessage` is one row in Postgres and one entry in the in-memory
//! scope map. `kind` decides which payload field is meaningful: Text
//! carries `body`, Image/Video/Gif carry `media_url`, Poll carries
//! `poll`. `created_at` is stamped by the server while holding the scope
//! write lock, so every reader of a scope observes the same total order
//! regardless of client clock skew. `rev` starts at 1 and increments on
//! every mutation (edit, vote); the persistence worker uses it to ack
//! dirty flags without losing concurrent updates.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// SCOPE
// =============================================================================

/// Partition key for chat subscriptions and writes.
///
/// Regional and college chats require the user to carry the matching
/// profile attribute; global chat is open to every authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum Scope {
    Global,
    Region(String),
    College(String),
}

impl Scope {
    /// Database discriminator column value.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Region(_) => "region",
            Scope::College(_) => "college",
        }
    }

    /// Database key column value (`None` for global).
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Region(key) | Scope::College(key) => Some(key),
        }
    }

    /// Rebuild a scope from its database columns.
    #[must_use]
    pub fn from_parts(kind: &str, key: Option<String>) -> Option<Scope> {
        match (kind, key) {
            ("global", _) => Some(Scope::Global),
            ("region", Some(key)) => Some(Scope::Region(key)),
            ("college", Some(key)) => Some(Scope::College(key)),
            _ => None,
        }
    }

    /// Whether a user with the given profile attributes may participate.
    /// Scoped variants require the attribute to be on file at all; the
    /// scope key itself comes from that attribute on join.
    #[must_use]
    pub fn member_allowed(&self, region: Option<&str>, college: Option<&str>) -> bool {
        match self {
            Scope::Global => true,
            Scope::Region(_) => region.is_some(),
            Scope::College(_) => college.is_some(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            None => write!(f, "{}", self.kind_str()),
            Some(key) => write!(f, "{}:{key}", self.kind_str()),
        }
    }
}

// =============================================================================
// ROLE / KIND
// =============================================================================

/// Closed set of participant roles carried on every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Mentor,
    Company,
    College,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Mentor => "mentor",
            Role::Company => "company",
            Role::College => "college",
            Role::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "student" => Some(Role::Student),
            "mentor" => Some(Role::Mentor),
            "company" => Some(Role::Company),
            "college" => Some(Role::College),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Content kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Gif,
    Poll,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Gif => "gif",
            MessageKind::Poll => "poll",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<MessageKind> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "gif" => Some(MessageKind::Gif),
            "poll" => Some(MessageKind::Poll),
            _ => None,
        }
    }

    /// Kinds whose payload is a media reference.
    #[must_use]
    pub fn requires_media(self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::Video | MessageKind::Gif)
    }
}

// =============================================================================
// POLL
// =============================================================================

/// One selectable poll option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    /// Opaque option identifier, assigned at poll creation.
    pub id: String,
    pub label: String,
    pub votes: u32,
}

/// Poll payload carried by `MessageKind::Poll` messages.
///
/// Invariants: `total_votes` equals the sum of option votes and is
/// monotonically non-decreasing; a voter id, once present, is never
/// removed by normal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPayload {
    pub question: String,
    pub options: Vec<PollOption>,
    pub total_votes: u32,
    pub voters: BTreeSet<Uuid>,
}

impl PollPayload {
    /// Build a zero-vote poll from a question and option labels.
    #[must_use]
    pub fn new(question: impl Into<String>, labels: &[String]) -> Self {
        let options = labels
            .iter()
            .map(|label| PollOption { id: Uuid::new_v4().to_string(), label: label.clone(), votes: 0 })
            .collect();
        Self { question: question.into(), options, total_votes: 0, voters: BTreeSet::new() }
    }

    /// Sum of per-option votes; equals `total_votes` when the payload is
    /// well formed.
    #[must_use]
    pub fn vote_sum(&self) -> u32 {
        self.options.iter().map(|o| o.votes).sum()
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// In-memory and wire representation of a chat message. Mirrors the
/// `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub scope: Scope,
    pub author_id: Uuid,
    pub author_name: String,
    pub author_role: Role,
    pub kind: MessageKind,
    /// Non-empty only for `Text`.
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollPayload>,
    /// Milliseconds since Unix epoch, server-assigned at write time.
    pub created_at: i64,
    pub edited: bool,
    /// Mutation counter used by the persistence ack path.
    pub rev: i32,
}
