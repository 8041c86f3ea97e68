// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages exchanged through the realtime transport.
use murmur_core::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};

use crate::channel_key::{ChannelMessage, MembershipRecord};
use crate::conversation_key::WrappedConversationKey;
use crate::edit::EditMessage;
use crate::sender_key::{GroupMessage, SenderKeyDistribution};
use crate::session::{PendingKeyExchange, RatchetCiphertext};

/// Direct message encrypted with the Double Ratchet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub sender: UserId,
    pub message: RatchetCiphertext,
}

/// Encrypted message body of any conversation kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Direct(DirectMessage),
    Group(GroupMessage),
    Channel(ChannelMessage),
    Edit(EditMessage),
}

impl Envelope {
    pub fn sender(&self) -> &UserId {
        match self {
            Envelope::Direct(message) => &message.sender,
            Envelope::Group(message) => &message.sender,
            Envelope::Channel(message) => &message.sender,
            Envelope::Edit(message) => &message.sender,
        }
    }

    /// Edits are only protected by the identity keys of their recipients.
    pub fn is_forward_secret(&self) -> bool {
        !matches!(self, Envelope::Edit(_))
    }
}

/// Decrypted content of an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plaintext {
    Message {
        sender: UserId,
        body: Vec<u8>,
    },
    Edit {
        sender: UserId,
        target: MessageId,
        body: Vec<u8>,
    },
}

impl Plaintext {
    pub fn sender(&self) -> &UserId {
        match self {
            Plaintext::Message { sender, .. } | Plaintext::Edit { sender, .. } => sender,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Plaintext::Message { body, .. } | Plaintext::Edit { body, .. } => body,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    Joined(UserId),
    Left(UserId),
}

/// Notifications delivered by the realtime transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    NewMessage {
        conversation: ConversationId,
        envelope: Envelope,
    },

    /// A peer published a key exchange addressed to us.
    KeyExchange(PendingKeyExchange),

    /// The responder accepted one of our key exchanges.
    KeyExchangeAccepted {
        conversation: ConversationId,
        initiator: UserId,
        responder: UserId,
    },

    MembershipChanged {
        conversation: ConversationId,
        change: MembershipChange,
    },

    SenderKeyDistribution(SenderKeyDistribution),

    ChannelKeyPush(MembershipRecord),

    ConversationKey(WrappedConversationKey),
}

impl TransportEvent {
    pub fn conversation(&self) -> &ConversationId {
        match self {
            TransportEvent::NewMessage { conversation, .. }
            | TransportEvent::KeyExchangeAccepted { conversation, .. }
            | TransportEvent::MembershipChanged { conversation, .. } => conversation,
            TransportEvent::KeyExchange(exchange) => &exchange.conversation,
            TransportEvent::SenderKeyDistribution(distribution) => &distribution.conversation,
            TransportEvent::ChannelKeyPush(record) => &record.channel,
            TransportEvent::ConversationKey(wrapped) => &wrapped.conversation,
        }
    }
}

/// Event the application has to deliver to a single user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub recipient: UserId,
    pub event: TransportEvent,
}

impl Outbound {
    pub fn new(recipient: UserId, event: TransportEvent) -> Self {
        Self { recipient, event }
    }
}
