// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for identifiers assigned by the chat server.
pub const MAX_IDENTIFIER_LEN: usize = 128;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: &str) -> Result<Self, IdentifierError> {
                if value.is_empty() {
                    return Err(IdentifierError::Empty);
                }

                if value.len() > MAX_IDENTIFIER_LEN {
                    return Err(IdentifierError::TooLong(value.len(), MAX_IDENTIFIER_LEN));
                }

                Ok(Self(value.to_owned()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl FromStr for $name {
            type Err = IdentifierError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdentifierError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

identifier!(
    /// Account identifier of a user, as assigned by the chat server.
    ///
    /// User ids have a total order which is used wherever two clients need to agree on a winner
    /// without talking to each other.
    UserId
);

identifier!(
    /// Identifier of a direct conversation, group or server channel.
    ConversationId
);

identifier!(
    /// Identifier of a single message inside a conversation.
    MessageId
);

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("identifier can not be empty")]
    Empty,

    #[error("identifier has {0} bytes, exceeding the maximum of {1}")]
    TooLong(usize, usize),
}
