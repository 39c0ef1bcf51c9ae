use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::{Generator, Ulid};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid identifier '{0}'")]
    Invalid(String),
}

macro_rules! sortable_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            pub fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Creation time embedded in the identifier.
            pub fn created_at(&self) -> DateTime<Utc> {
                ulid_timestamp(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s.trim())
                    .map(Self)
                    .map_err(|_| IdError::Invalid(s.to_string()))
            }
        }
    };
}

sortable_id!(
    /// Identifier of a chat. Lexicographic order equals creation order.
    ChatId
);

sortable_id!(
    /// Identifier of a message within a chat; doubles as the history sort key.
    MessageId
);

fn ulid_timestamp(ulid: Ulid) -> DateTime<Utc> {
    let millis = i64::try_from(ulid.timestamp_ms()).unwrap_or(i64::MAX);
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// Process-scoped monotonic ULID source.
///
/// Identifiers produced within the same millisecond increment the random
/// component, so successive calls are strictly increasing. When that
/// component is exhausted the generator waits for the next millisecond.
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    pub fn next_ulid(&self) -> Ulid {
        let mut generator = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        next_monotonic(&mut generator, SystemTime::now)
    }

    pub fn chat_id(&self) -> ChatId {
        ChatId::from_ulid(self.next_ulid())
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::from_ulid(self.next_ulid())
    }
}

fn next_monotonic(generator: &mut Generator, mut clock: impl FnMut() -> SystemTime) -> Ulid {
    loop {
        match generator.generate_from_datetime(clock()) {
            Ok(ulid) => return ulid,
            // 80-bit random part overflowed within this millisecond.
            Err(_) => std::hint::spin_loop(),
        }
    }
}
