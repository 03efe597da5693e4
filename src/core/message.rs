//! Message type shared by the queue pipeline.
//!
//! A message is an immutable payload plus a unique identifier, a persistence
//! flag and content properties. Identity (and equality) is the identifier.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique message identifier, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn fresh() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Content properties carried alongside the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageProps {
    /// Absolute expiry in microseconds since the epoch. `None` means no TTL.
    pub expiry_us: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    payload: Bytes,
    is_persistent: bool,
    props: MessageProps,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, is_persistent: bool) -> Self {
        Message {
            id: MessageId::fresh(),
            payload: payload.into(),
            is_persistent,
            props: MessageProps::default(),
        }
    }

    pub fn with_props(payload: impl Into<Bytes>, is_persistent: bool, props: MessageProps) -> Self {
        Message {
            id: MessageId::fresh(),
            payload: payload.into(),
            is_persistent,
            props,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_persistent(&self) -> bool {
        self.is_persistent
    }

    pub fn props(&self) -> &MessageProps {
        &self.props
    }

    /// Stamps an absolute expiry if the message does not already carry one.
    pub fn stamp_expiry(&mut self, expiry_us: u64) {
        if self.props.expiry_us.is_none() {
            self.props.expiry_us = Some(expiry_us);
        }
    }

    pub fn is_expired(&self, now_us: u64) -> bool {
        matches!(self.props.expiry_us, Some(at) if at <= now_us)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

/// Current system time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before the Unix epoch")
        .as_micros() as u64
}
