// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double Ratchet for direct messages between two users.
//!
//! The shared secret of the X3DH handshake becomes the first root key. Both sides then keep two
//! symmetric chains (sending and receiving) which advance with every message, while every change
//! of direction in the conversation performs a Diffie-Hellman step with fresh ratchet keys and
//! replaces the chains. Message keys are used exactly once and deleted afterwards.
//!
//! Messages may arrive out of order. Keys for messages we skipped over are kept in a bounded
//! buffer until they are used or evicted. A message whose key was already consumed or evicted can
//! never be decrypted again, this includes replays.
//!
//! <https://signal.org/docs/specifications/doubleratchet/>
use std::collections::VecDeque;

use murmur_core::{ConversationId, EncodeError, encode_cbor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ChainKey, MessageKey};
use crate::config::SkipLimits;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{AeadCiphertext, CryptoEngine, CryptoError, Secret};
use crate::error::ErrorKind;
use crate::identity::IdentityKey;
use crate::session::SharedSecret;

const ROOT_KDF_INFO: &[u8] = b"murmur-ratchet";

/// Number of superseded peer ratchet keys we remember to detect messages of finished chains.
const RETIRED_RATCHET_KEYS: usize = 16;

pub type RootKey = Secret<32>;

/// Double Ratchet protocol for direct messages.
///
/// All methods are pure functions consuming the current session state and returning the updated
/// one, the caller persists the new state before handing out any result.
pub struct Ratchet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetStatus {
    /// We did not decrypt a single message of the peer yet.
    AwaitingFirstMessage,

    /// Both sides proved to hold the session, it can not be replaced anymore.
    Ratcheting,
}

/// Public header sent in plaintext next to every direct message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Current ratchet public key of the sender.
    pub ratchet_key: PublicKey,

    /// Number of messages in the sender's previous sending chain.
    pub previous_count: u32,

    /// Position of this message in the sender's current sending chain.
    pub counter: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetCiphertext {
    pub header: RatchetHeader,
    pub ciphertext: AeadCiphertext,
}

#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
struct SkippedKey {
    ratchet_key: PublicKey,
    counter: u32,
    key: MessageKey,
}

/// State of a direct session with one peer in one conversation.
#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct SessionState {
    conversation: ConversationId,
    role: Role,
    status: RatchetStatus,
    peer_identity: IdentityKey,

    /// Identities of both parties, bound to every message.
    #[serde(with = "serde_bytes")]
    associated_data: Vec<u8>,

    root_key: RootKey,
    sending_chain: ChainKey,
    receiving_chain: Option<ChainKey>,

    /// Our current ratchet key pair, the public half is sent with every message.
    ratchet_secret: SecretKey,

    /// Latest ratchet public key of the peer.
    peer_ratchet_key: PublicKey,

    /// Message numbers "Ns", "Nr" and "PN".
    send_count: u32,
    recv_count: u32,
    previous_count: u32,

    skipped: VecDeque<SkippedKey>,
    retired_ratchet_keys: VecDeque<PublicKey>,
}

impl SessionState {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> RatchetStatus {
        self.status
    }

    pub fn peer_identity(&self) -> &IdentityKey {
        &self.peer_identity
    }

    /// Our current ratchet public key.
    pub fn ratchet_key(&self) -> PublicKey {
        self.ratchet_secret.public_key()
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    pub fn recv_count(&self) -> u32 {
        self.recv_count
    }

    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }
}

fn kdf_root<E: CryptoEngine>(
    root_key: &RootKey,
    dh_output: &[u8],
    engine: &E,
) -> Result<(RootKey, ChainKey), CryptoError> {
    let output: [u8; 64] = engine.derive_key(root_key.as_bytes(), dh_output, ROOT_KDF_INFO)?;
    let mut root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    root_key.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);
    Ok((Secret::from_bytes(root_key), ChainKey::from_bytes(chain_key)))
}

fn message_aad(y: &SessionState, header: &RatchetHeader) -> Result<Vec<u8>, RatchetError> {
    let mut aad = y.associated_data.clone();
    aad.extend_from_slice(&encode_cbor(&(&y.conversation, header))?);
    Ok(aad)
}

impl Ratchet {
    /// Initialises the session of the initiator right after X3DH.
    ///
    /// The signed prekey of the responder serves as their first ratchet key.
    pub fn init_initiator<E: CryptoEngine>(
        conversation: ConversationId,
        shared_secret: SharedSecret,
        peer_identity: IdentityKey,
        peer_signed_prekey: PublicKey,
        engine: &E,
    ) -> Result<SessionState, RatchetError> {
        let ratchet_secret = engine.new_kem_secret()?;
        let dh_output = engine.agree(&ratchet_secret, &peer_signed_prekey)?;
        let (root_key, sending_chain) = kdf_root(&shared_secret.secret, &dh_output, engine)?;

        Ok(SessionState {
            conversation,
            role: Role::Initiator,
            status: RatchetStatus::AwaitingFirstMessage,
            peer_identity,
            associated_data: shared_secret.associated_data,
            root_key,
            sending_chain,
            receiving_chain: None,
            ratchet_secret,
            peer_ratchet_key: peer_signed_prekey,
            send_count: 0,
            recv_count: 0,
            previous_count: 0,
            skipped: VecDeque::new(),
            retired_ratchet_keys: VecDeque::new(),
        })
    }

    /// Initialises the session of the responder when accepting a key exchange.
    ///
    /// The responder learns the first ratchet key of the initiator from the exchange and performs
    /// the first Diffie-Hellman step right away, so it can send before the initiator's first
    /// message arrived.
    pub fn init_responder<E: CryptoEngine>(
        conversation: ConversationId,
        shared_secret: SharedSecret,
        peer_identity: IdentityKey,
        peer_ratchet_key: PublicKey,
        our_prekey_secret: &SecretKey,
        engine: &E,
    ) -> Result<SessionState, RatchetError> {
        let dh_output = engine.agree(our_prekey_secret, &peer_ratchet_key)?;
        let (root_key, receiving_chain) = kdf_root(&shared_secret.secret, &dh_output, engine)?;

        let ratchet_secret = engine.new_kem_secret()?;
        let dh_output = engine.agree(&ratchet_secret, &peer_ratchet_key)?;
        let (root_key, sending_chain) = kdf_root(&root_key, &dh_output, engine)?;

        Ok(SessionState {
            conversation,
            role: Role::Responder,
            status: RatchetStatus::AwaitingFirstMessage,
            peer_identity,
            associated_data: shared_secret.associated_data,
            root_key,
            sending_chain,
            receiving_chain: Some(receiving_chain),
            ratchet_secret,
            peer_ratchet_key,
            send_count: 0,
            recv_count: 0,
            previous_count: 0,
            skipped: VecDeque::new(),
            retired_ratchet_keys: VecDeque::new(),
        })
    }

    /// Encrypts a message with the next key of the sending chain.
    pub fn encrypt<E: CryptoEngine>(
        mut y: SessionState,
        plaintext: &[u8],
        engine: &E,
    ) -> Result<(SessionState, RatchetCiphertext), RatchetError> {
        let (sending_chain, message_key) = y.sending_chain.step(engine)?;

        let header = RatchetHeader {
            ratchet_key: y.ratchet_secret.public_key(),
            previous_count: y.previous_count,
            counter: y.send_count,
        };
        let aad = message_aad(&y, &header)?;
        let ciphertext = engine.aead_seal(&message_key, plaintext, &aad)?;

        y.sending_chain = sending_chain;
        y.send_count = y
            .send_count
            .checked_add(1)
            .ok_or(RatchetError::ChainExhausted)?;

        Ok((y, RatchetCiphertext { header, ciphertext }))
    }

    /// Decrypts a message of the peer, performing a Diffie-Hellman step when the peer started a
    /// new sending chain.
    pub fn decrypt<E: CryptoEngine>(
        mut y: SessionState,
        message: &RatchetCiphertext,
        limits: &SkipLimits,
        engine: &E,
    ) -> Result<(SessionState, Vec<u8>), RatchetError> {
        let header = &message.header;

        // Key of a message we skipped over earlier.
        if let Some(index) = y.skipped.iter().position(|skipped| {
            skipped.ratchet_key == header.ratchet_key && skipped.counter == header.counter
        }) {
            let skipped = y
                .skipped
                .remove(index)
                .ok_or(RatchetError::MessageKeyUnavailable(header.counter))?;
            let plaintext = Self::open(&y, message, &skipped.key, engine)?;
            y.status = RatchetStatus::Ratcheting;
            return Ok((y, plaintext));
        }

        // Chains of superseded ratchet keys only live on through their skipped keys.
        if y.retired_ratchet_keys.contains(&header.ratchet_key) {
            return Err(RatchetError::MessageKeyUnavailable(header.counter));
        }

        if header.ratchet_key != y.peer_ratchet_key || y.receiving_chain.is_none() {
            y = Self::skip_message_keys(y, header.previous_count, limits, engine)?;
            y = Self::dh_step(y, header.ratchet_key, engine)?;
        }

        if header.counter < y.recv_count {
            return Err(RatchetError::MessageKeyUnavailable(header.counter));
        }

        y = Self::skip_message_keys(y, header.counter, limits, engine)?;

        let receiving_chain = y
            .receiving_chain
            .as_ref()
            .ok_or(RatchetError::MessageKeyUnavailable(header.counter))?;
        let (receiving_chain, message_key) = receiving_chain.step(engine)?;
        let plaintext = Self::open(&y, message, &message_key, engine)?;

        y.receiving_chain = Some(receiving_chain);
        y.recv_count = header.counter.saturating_add(1);
        y.status = RatchetStatus::Ratcheting;

        Ok((y, plaintext))
    }

    fn open<E: CryptoEngine>(
        y: &SessionState,
        message: &RatchetCiphertext,
        message_key: &MessageKey,
        engine: &E,
    ) -> Result<Vec<u8>, RatchetError> {
        let aad = message_aad(y, &message.header)?;
        Ok(engine.aead_open(message_key, &message.ciphertext, &aad)?)
    }

    /// Stores the keys of the current receiving chain up to (excluding) `until`.
    fn skip_message_keys<E: CryptoEngine>(
        mut y: SessionState,
        until: u32,
        limits: &SkipLimits,
        engine: &E,
    ) -> Result<SessionState, RatchetError> {
        let Some(mut receiving_chain) = y.receiving_chain.take() else {
            return Ok(y);
        };

        if until.saturating_sub(y.recv_count) > limits.max_skip {
            return Err(RatchetError::TooManySkipped(until - y.recv_count));
        }

        while y.recv_count < until {
            let (next_chain, message_key) = receiving_chain.step(engine)?;
            y.skipped.push_back(SkippedKey {
                ratchet_key: y.peer_ratchet_key,
                counter: y.recv_count,
                key: message_key,
            });
            receiving_chain = next_chain;
            y.recv_count += 1;
        }

        while y.skipped.len() > limits.max_skipped_keys {
            y.skipped.pop_front();
        }

        y.receiving_chain = Some(receiving_chain);
        Ok(y)
    }

    fn dh_step<E: CryptoEngine>(
        mut y: SessionState,
        peer_ratchet_key: PublicKey,
        engine: &E,
    ) -> Result<SessionState, RatchetError> {
        y.retired_ratchet_keys.push_back(y.peer_ratchet_key);
        while y.retired_ratchet_keys.len() > RETIRED_RATCHET_KEYS {
            y.retired_ratchet_keys.pop_front();
        }

        y.previous_count = y.send_count;
        y.send_count = 0;
        y.recv_count = 0;
        y.peer_ratchet_key = peer_ratchet_key;

        let dh_output = engine.agree(&y.ratchet_secret, &peer_ratchet_key)?;
        let (root_key, receiving_chain) = kdf_root(&y.root_key, &dh_output, engine)?;

        let ratchet_secret = engine.new_kem_secret()?;
        let dh_output = engine.agree(&ratchet_secret, &peer_ratchet_key)?;
        let (root_key, sending_chain) = kdf_root(&root_key, &dh_output, engine)?;

        y.root_key = root_key;
        y.receiving_chain = Some(receiving_chain);
        y.sending_chain = sending_chain;
        y.ratchet_secret = ratchet_secret;

        Ok(y)
    }
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("message key {0} was already used or is not retained anymore")]
    MessageKeyUnavailable(u32),

    #[error("message would skip {0} keys, exceeding the limit")]
    TooManySkipped(u32),

    #[error("sending chain reached its maximum length")]
    ChainExhausted,
}

impl RatchetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RatchetError::Crypto(err) => err.kind(),
            RatchetError::MessageKeyUnavailable(_) | RatchetError::TooManySkipped(_) => {
                ErrorKind::Verification
            }
            RatchetError::Encode(_) | RatchetError::ChainExhausted => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use murmur_core::ConversationId;

    use crate::config::SkipLimits;
    use crate::crypto::{Crypto, CryptoEngine};
    use crate::identity::IdentityKeyPair;
    use crate::key_bundle::{Lifetime, PreKey, PrekeyBundle};
    use crate::session::{x3dh_initiate, x3dh_respond};

    use super::{Ratchet, RatchetError, RatchetStatus, SessionState};

    fn establish(engine: &Crypto) -> (SessionState, SessionState) {
        let conversation = ConversationId::new("dm").unwrap();

        let alice = IdentityKeyPair::generate(engine).unwrap();
        let bob = IdentityKeyPair::generate(engine).unwrap();
        let bob_prekey_secret = engine.new_kem_secret().unwrap();
        let bob_prekey = PreKey::new(bob_prekey_secret.public_key(), Lifetime::default());
        let signature = bob_prekey.sign(bob.signing_key(), engine).unwrap();
        let bundle = PrekeyBundle::new(bob.public_key(), bob_prekey, signature, None);

        let (alice_secret, ephemeral_key) = x3dh_initiate(&alice, &bundle, engine).unwrap();
        let alice_state = Ratchet::init_initiator(
            conversation.clone(),
            alice_secret,
            bob.public_key(),
            *bundle.signed_prekey(),
            engine,
        )
        .unwrap();

        let bob_secret = x3dh_respond(
            &alice.public_key(),
            &ephemeral_key,
            &bob,
            &bob_prekey_secret,
            None,
            engine,
        )
        .unwrap();
        let bob_state = Ratchet::init_responder(
            conversation,
            bob_secret,
            alice.public_key(),
            alice_state.ratchet_key(),
            &bob_prekey_secret,
            engine,
        )
        .unwrap();

        (alice_state, bob_state)
    }

    #[test]
    fn ping_pong() {
        let engine = Crypto::from_seed([1; 32]);
        let limits = SkipLimits::default();
        let (alice, bob) = establish(&engine);

        let (alice, message) = Ratchet::encrypt(alice, b"hello", &engine).unwrap();
        let (bob, plaintext) = Ratchet::decrypt(bob, &message, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"hello");
        assert_eq!(bob.status(), RatchetStatus::Ratcheting);
        assert_eq!(alice.status(), RatchetStatus::AwaitingFirstMessage);

        let (bob, message) = Ratchet::encrypt(bob, b"hi", &engine).unwrap();
        let (alice, plaintext) = Ratchet::decrypt(alice, &message, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"hi");
        assert_eq!(alice.status(), RatchetStatus::Ratcheting);

        // Both sending chains advanced by exactly one.
        assert_eq!(alice.send_count(), 0); // reset by the ratchet step
        assert_eq!(alice.recv_count(), 1);
        assert_eq!(bob.send_count(), 1);
        assert_eq!(bob.recv_count(), 1);

        // Several direction changes.
        let mut alice = alice;
        let mut bob = bob;
        for round in 0..3u8 {
            let (next, message) = Ratchet::encrypt(alice, &[round], &engine).unwrap();
            alice = next;
            let (next, plaintext) = Ratchet::decrypt(bob, &message, &limits, &engine).unwrap();
            bob = next;
            assert_eq!(plaintext, vec![round]);

            let (next, message) = Ratchet::encrypt(bob, &[round, round], &engine).unwrap();
            bob = next;
            let (next, plaintext) = Ratchet::decrypt(alice, &message, &limits, &engine).unwrap();
            alice = next;
            assert_eq!(plaintext, vec![round, round]);
        }
    }

    #[test]
    fn responder_sends_first() {
        let engine = Crypto::from_seed([2; 32]);
        let limits = SkipLimits::default();
        let (alice, bob) = establish(&engine);

        let (_bob, message) = Ratchet::encrypt(bob, b"first!", &engine).unwrap();
        let (alice, plaintext) = Ratchet::decrypt(alice, &message, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"first!");
        assert_eq!(alice.status(), RatchetStatus::Ratcheting);
    }

    #[test]
    fn out_of_order_and_replay() {
        let engine = Crypto::from_seed([3; 32]);
        let limits = SkipLimits::default();
        let (alice, bob) = establish(&engine);

        let (alice, message_0) = Ratchet::encrypt(alice, b"zero", &engine).unwrap();
        let (alice, message_1) = Ratchet::encrypt(alice, b"one", &engine).unwrap();
        let (_alice, message_2) = Ratchet::encrypt(alice, b"two", &engine).unwrap();

        let (bob, plaintext) = Ratchet::decrypt(bob, &message_2, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"two");
        assert_eq!(bob.skipped_keys(), 2);

        let (bob, plaintext) = Ratchet::decrypt(bob, &message_0, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"zero");
        let (bob, plaintext) = Ratchet::decrypt(bob, &message_1, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"one");
        assert_eq!(bob.skipped_keys(), 0);

        // Every key was consumed once.
        let result = Ratchet::decrypt(bob.clone(), &message_1, &limits, &engine);
        assert_matches!(result, Err(RatchetError::MessageKeyUnavailable(1)));
        assert_matches!(
            Ratchet::decrypt(bob, &message_2, &limits, &engine),
            Err(RatchetError::MessageKeyUnavailable(2))
        );
    }

    #[test]
    fn skip_limits() {
        let engine = Crypto::from_seed([4; 32]);
        let limits = SkipLimits {
            max_skip: 2,
            max_skipped_keys: 2,
        };
        let (mut alice, bob) = establish(&engine);

        let mut messages = Vec::new();
        for i in 0..4u8 {
            let (next, message) = Ratchet::encrypt(alice, &[i], &engine).unwrap();
            alice = next;
            messages.push(message);
        }

        // Skipping three keys at once is too much.
        assert_matches!(
            Ratchet::decrypt(bob.clone(), &messages[3], &limits, &engine),
            Err(RatchetError::TooManySkipped(3))
        );

        let (bob, _) = Ratchet::decrypt(bob, &messages[2], &limits, &engine).unwrap();
        assert_eq!(bob.skipped_keys(), 2);
        let (bob, _) = Ratchet::decrypt(bob, &messages[3], &limits, &engine).unwrap();
        let (bob, plaintext) = Ratchet::decrypt(bob, &messages[0], &limits, &engine).unwrap();
        assert_eq!(plaintext, vec![0]);
        assert_eq!(bob.skipped_keys(), 1);
    }

    #[test]
    fn messages_of_finished_chains() {
        let engine = Crypto::from_seed([5; 32]);
        let limits = SkipLimits::default();
        let (alice, bob) = establish(&engine);

        let (alice, late) = Ratchet::encrypt(alice, b"late", &engine).unwrap();
        let (alice, message) = Ratchet::encrypt(alice, b"on time", &engine).unwrap();
        let (bob, _) = Ratchet::decrypt(bob, &message, &limits, &engine).unwrap();

        // Bob answers, Alice starts a new chain.
        let (bob, reply) = Ratchet::encrypt(bob, b"reply", &engine).unwrap();
        let (alice, _) = Ratchet::decrypt(alice, &reply, &limits, &engine).unwrap();
        let (_alice, message) = Ratchet::encrypt(alice, b"new chain", &engine).unwrap();
        let (bob, plaintext) = Ratchet::decrypt(bob, &message, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"new chain");

        // Key of the late message was skipped in the old chain and is still usable once.
        let (bob, plaintext) = Ratchet::decrypt(bob, &late, &limits, &engine).unwrap();
        assert_eq!(plaintext, b"late");
        assert_matches!(
            Ratchet::decrypt(bob, &late, &limits, &engine),
            Err(RatchetError::MessageKeyUnavailable(0))
        );
    }

    #[test]
    fn tampered_header() {
        let engine = Crypto::from_seed([6; 32]);
        let limits = SkipLimits::default();
        let (alice, bob) = establish(&engine);

        let (alice, _) = Ratchet::encrypt(alice, b"zero", &engine).unwrap();
        let (_alice, mut message) = Ratchet::encrypt(alice, b"one", &engine).unwrap();
        message.header.previous_count = 7;

        let result = Ratchet::decrypt(bob, &message, &limits, &engine);
        assert_matches!(result, Err(RatchetError::Crypto(_)));
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Verification);
    }
}
