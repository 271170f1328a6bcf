use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::{Timestamp, Version};

/// An immutable, persisted event.
///
/// `version` and `create_time` are assigned by the store; everything else is
/// producer input carried through unchanged.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Event {
    pub version: Version,
    pub create_time: Timestamp,
    pub key: String,
    pub value: Vec<u8>,
    pub event_type: Option<String>,
    pub namespace: Option<String>,
    pub sender: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum EventValidationError {
    #[snafu(display("Event key must not be empty"))]
    EmptyKey,
}

/// Producer-side event, before the store assigned a version.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct EventDraft {
    pub key: String,
    pub value: Vec<u8>,
    pub event_type: Option<String>,
    pub namespace: Option<String>,
    pub sender: Option<String>,
    pub context: Option<String>,
}

#[bon::bon]
impl EventDraft {
    #[builder]
    pub fn new(
        #[builder(into)] key: String,
        #[builder(into)] value: Vec<u8>,
        #[builder(into)] event_type: Option<String>,
        #[builder(into)] namespace: Option<String>,
        #[builder(into)] sender: Option<String>,
        #[builder(into)] context: Option<String>,
    ) -> Self {
        Self {
            key,
            value,
            event_type,
            namespace,
            sender,
            context,
        }
    }
}

impl EventDraft {
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.key.is_empty() {
            return Err(EventValidationError::EmptyKey);
        }
        Ok(())
    }

    /// Completes the draft into a persisted event.
    pub fn into_event(self, version: Version, create_time: Timestamp) -> Event {
        Event {
            version,
            create_time,
            key: self.key,
            value: self.value,
            event_type: self.event_type,
            namespace: self.namespace,
            sender: self.sender,
            context: self.context,
        }
    }
}
