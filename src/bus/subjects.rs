//! Ingestion topics and relay subjects
//!
//! - Ingestion topic: `things/{thingId}` (broker side, `/`-separated)
//! - Relay subject: `thingsMsg.{thingId}` (bus side, `.`-separated)
//!
//! A thing id is a single segment matching `[a-zA-Z0-9_-]+`, so it can never
//! introduce extra levels on either side.

use std::fmt;
use thiserror::Error;

/// Topic prefix devices publish under
pub const INGEST_TOPIC_PREFIX: &str = "things";

/// Broker filter matching every thing topic
pub const INGEST_TOPIC_FILTER: &str = "things/+";

/// Subject prefix readings are relayed under
pub const RELAY_SUBJECT_PREFIX: &str = "thingsMsg";

fn is_valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Validate a thing id
pub fn is_valid_thing_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_segment_char)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("topic '{0}' is not under 'things/'")]
    WrongPrefix(String),

    #[error("topic has an empty thing id")]
    EmptyThingId,

    #[error("invalid thing id '{0}': must match [a-zA-Z0-9_-]+")]
    InvalidThingId(String),
}

/// Extract the thing id from the last segment of an ingestion topic
pub fn parse_ingest_topic(topic: &str) -> Result<String, SubjectError> {
    let mut segments = topic.split('/');
    if segments.next() != Some(INGEST_TOPIC_PREFIX) {
        return Err(SubjectError::WrongPrefix(topic.to_string()));
    }

    let thing_id = segments.last().unwrap_or_default();
    if thing_id.is_empty() {
        return Err(SubjectError::EmptyThingId);
    }
    if !is_valid_thing_id(thing_id) {
        return Err(SubjectError::InvalidThingId(thing_id.to_string()));
    }

    Ok(thing_id.to_string())
}

/// Ingestion topic for a thing
pub fn ingest_topic(thing_id: &str) -> String {
    format!("{}/{}", INGEST_TOPIC_PREFIX, thing_id)
}

/// A validated relay subject
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    name: String,
    thing_id_start: usize,
}

impl Subject {
    /// Relay subject for a thing
    pub fn for_thing(thing_id: &str) -> Result<Self, SubjectError> {
        if !is_valid_thing_id(thing_id) {
            return Err(SubjectError::InvalidThingId(thing_id.to_string()));
        }

        Ok(Self {
            name: format!("{}.{}", RELAY_SUBJECT_PREFIX, thing_id),
            thing_id_start: RELAY_SUBJECT_PREFIX.len() + 1,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn thing_id(&self) -> &str {
        &self.name[self.thing_id_start..]
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
