// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry point for applications: establishes sessions, encrypts outgoing and decrypts incoming
//! messages of direct, group and channel conversations.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use murmur_core::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::channel_key::{ChannelKeyError, ChannelKeyRing, ChannelKeys, MembershipRecord};
use crate::config::Config;
use crate::conversation_key::{
    ConversationKey, ConversationKeyError, ConversationMetadata, WrappedConversationKey,
};
use crate::crypto::{AeadCiphertext, Crypto, CryptoEngine};
use crate::edit::{Edit, EditError};
use crate::envelope::{
    DirectMessage, Envelope, MembershipChange, Outbound, Plaintext, TransportEvent,
};
use crate::error::ErrorKind;
use crate::fingerprint::safety_fingerprint;
use crate::identity::IdentityKey;
use crate::key_bundle::{KeyBundleError, OneTimePreKeyId};
use crate::key_manager::KeyManagerError;
use crate::key_store::{KeyStore, KeyStoreError};
use crate::sealed::{BlobKey, DeviceKey};
use crate::sender_key::{SenderKey, SenderKeyDistribution, SenderKeyError, SenderKeyState};
use crate::session::{
    EstablishError, KeyExchange, PendingKeyExchange, Ratchet, RatchetError, RatchetStatus, Role,
    SessionState, X3dhError,
};
use crate::traits::{Directory, Persistence};

/// Outcome of establishing a direct session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Messages can be sent.
    Ready,

    /// No session could be established, the conversation stays usable for everything else.
    Degraded(DegradedReason),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DegradedReason {
    /// The directory had no prekeys of the peer or could not be reached.
    PrekeyBundleUnavailable,

    /// Signed prekey of the peer was not signed by their identity.
    InvalidPrekeySignature,

    /// Signed prekey of the peer is outside of its lifetime.
    ExpiredPrekey,
}

/// Kind and members of a conversation we take part in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Direct { peer: UserId },
    Group { members: BTreeSet<UserId> },
    Channel { members: BTreeSet<UserId> },
}

impl ConversationKind {
    /// All members except us.
    pub fn recipients(&self, us: &UserId) -> Vec<UserId> {
        match self {
            ConversationKind::Direct { peer } => vec![peer.clone()],
            ConversationKind::Group { members } | ConversationKind::Channel { members } => members
                .iter()
                .filter(|member| *member != us)
                .cloned()
                .collect(),
        }
    }

    /// Returns true if the user takes part in the conversation. We are not listed as peer of our
    /// own direct conversations.
    pub fn contains(&self, user: &UserId) -> bool {
        match self {
            ConversationKind::Direct { peer } => peer == user,
            ConversationKind::Group { members } | ConversationKind::Channel { members } => {
                members.contains(user)
            }
        }
    }

    /// Merges members of the same conversation kind, fails when the kinds differ.
    fn merge(&mut self, other: ConversationKind) -> bool {
        match (self, other) {
            (ConversationKind::Direct { peer }, ConversationKind::Direct { peer: other }) => {
                *peer == other
            }
            (
                ConversationKind::Group { members },
                ConversationKind::Group { members: other },
            )
            | (
                ConversationKind::Channel { members },
                ConversationKind::Channel { members: other },
            ) => {
                members.extend(other);
                true
            }
            _ => false,
        }
    }
}

type ConversationRegistry = BTreeMap<ConversationId, ConversationKind>;

/// Key material which arrived before we joined the conversation.
///
/// Nothing of it is applied until we know the members, at most one entry is kept per sender.
#[derive(Default, Serialize, Deserialize)]
struct PendingKeys {
    distributions: Vec<SenderKeyDistribution>,
    conversation_keys: Vec<WrappedConversationKey>,
}

/// Result of handling a transport event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Decrypted {
        conversation: ConversationId,
        plaintext: Plaintext,
    },

    Session {
        conversation: ConversationId,
        peer: UserId,
        status: SessionStatus,
    },

    /// Key material for the conversation arrived.
    KeysUpdated { conversation: ConversationId },

    /// Key material arrived for a conversation we did not join yet. It is applied when joining,
    /// if the sender is one of the members.
    Deferred { conversation: ConversationId },

    /// Members changed, the application has to deliver the returned events.
    Outbound(Vec<Outbound>),

    Ignored,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum LockKey {
    Session(ConversationId, UserId),
    Conversation(ConversationId),
    Registry,
}

impl LockKey {
    fn session(conversation: &ConversationId, peer: &UserId) -> Self {
        LockKey::Session(conversation.clone(), peer.clone())
    }

    fn conversation(conversation: &ConversationId) -> Self {
        LockKey::Conversation(conversation.clone())
    }
}

/// Key management and encryption for one user on one device.
///
/// Every direct session and every group or channel is a single-writer resource: its state is
/// loaded, changed and persisted while holding the lock of that resource. Results are only handed
/// out after the new state was persisted.
pub struct Manager<D, P, E = Crypto> {
    user: UserId,
    config: Config,
    directory: D,
    key_store: KeyStore<P, E>,
    engine: Arc<E>,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl<D, P, E> Manager<D, P, E>
where
    D: Directory,
    P: Persistence,
    E: CryptoEngine,
{
    /// Loads our identity from the persistence service or creates it on first start.
    pub async fn init(
        user: UserId,
        config: Config,
        directory: D,
        persistence: P,
        device_key: DeviceKey,
        engine: E,
    ) -> Result<Self, ManagerError<D, P>> {
        let engine = Arc::new(engine);
        let key_store = KeyStore::new(persistence, device_key, engine.clone());

        let identity = match key_store.load_identity().await {
            Ok(identity) => identity,
            Err(KeyStoreError::IdentityNotFound) => {
                key_store.generate_identity(config.lifetime()).await?
            }
            Err(err) => return Err(err.into()),
        };
        debug!(%user, identity = %identity.public_key(), "initialised manager");

        Ok(Self {
            user,
            config,
            directory,
            key_store,
            engine,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn key_store(&self) -> &KeyStore<P, E> {
        &self.key_store
    }

    pub async fn identity(&self) -> Result<IdentityKey, ManagerError<D, P>> {
        Ok(self.key_store.load_identity().await?.public_key())
    }

    // Prekeys.

    /// Uploads our latest signed prekey and fresh one-time prekeys to the directory.
    ///
    /// Returns the number of uploaded one-time prekeys.
    pub async fn publish_prekeys(&self) -> Result<usize, ManagerError<D, P>> {
        self.key_store
            .replenish_onetime_prekeys(self.config.onetime_prekey_target)
            .await?;
        let published = self.key_store.published_prekeys().await?;

        // TODO: Return drawn one-time prekeys to the unpublished set when the upload fails.
        self.directory
            .publish_prekeys(&self.user, &published)
            .await
            .map_err(ManagerError::Directory)?;

        debug!(
            onetime_prekeys = published.onetime_prekeys.len(),
            "published prekeys"
        );
        Ok(published.onetime_prekeys.len())
    }

    /// Rotates the signed prekey when it is due, removes expired ones and replenishes one-time
    /// prekeys on the directory.
    pub async fn maintain_prekeys(&self) -> Result<(), ManagerError<D, P>> {
        if self
            .key_store
            .needs_rotation(self.config.prekey_rotate_after)
            .await?
        {
            let prekey = self
                .key_store
                .rotate_signed_prekey(self.config.lifetime())
                .await?;
            debug!(prekey = %prekey.id(), "rotated signed prekey");
        }

        self.key_store.remove_expired_prekeys().await?;
        self.publish_prekeys().await?;
        Ok(())
    }

    // Direct sessions.

    /// Makes sure a direct session with the peer exists for this conversation.
    ///
    /// An existing session is reused, a key exchange of the peer is accepted, otherwise we
    /// initiate one ourselves. Problems with the peer's prekeys leave the conversation degraded
    /// instead of failing.
    pub async fn ensure_session(
        &self,
        conversation: &ConversationId,
        peer: &UserId,
    ) -> Result<SessionStatus, ManagerError<D, P>> {
        if peer == &self.user {
            return Err(ManagerError::InvalidPeer(peer.clone()));
        }

        let _guard = self.lock(LockKey::session(conversation, peer)).await;
        self.register(
            conversation,
            ConversationKind::Direct { peer: peer.clone() },
        )
        .await?;

        let existing = self.key_store.get_session(conversation, peer).await?;
        if let Some(y) = &existing {
            if y.status() == RatchetStatus::Ratcheting {
                return Ok(SessionStatus::Ready);
            }
        }

        let exchanges = match self.directory.key_exchanges(conversation, &self.user).await {
            Ok(exchanges) => exchanges,
            Err(err) if existing.is_some() => {
                warn!("could not look up key exchanges, keep existing session: {err}");
                return Ok(SessionStatus::Ready);
            }
            Err(err) => return Err(ManagerError::Directory(err)),
        };

        let theirs = exchanges
            .iter()
            .find(|exchange| &exchange.initiator == peer && exchange.responder == self.user);
        let ours = exchanges
            .iter()
            .find(|exchange| exchange.initiator == self.user && &exchange.responder == peer);

        if let Some(exchange) = theirs {
            if self.yields_to(existing.as_ref(), peer) {
                match self.accept_exchange(exchange).await {
                    Ok(()) => {
                        if ours.is_some() {
                            self.withdraw_exchange(conversation, peer).await;
                        }
                        return Ok(SessionStatus::Ready);
                    }
                    Err(err) => warn!(%conversation, %peer, "could not accept key exchange: {err}"),
                }
            }
        }

        if existing.is_some() {
            return Ok(SessionStatus::Ready);
        }

        if let Some(exchange) = ours {
            let key = KeyStore::<P, E>::session_key(conversation, peer);
            match self
                .key_store
                .open::<SessionState>(&key, &exchange.initiator_state)
            {
                Ok(y) => {
                    self.key_store.put_session(conversation, peer, &y).await?;
                    debug!(%conversation, %peer, "restored session from own key exchange");
                    return Ok(SessionStatus::Ready);
                }
                Err(err) => {
                    warn!(%conversation, %peer, "could not restore own key exchange: {err}")
                }
            }
        }

        self.initiate_session(conversation, peer).await
    }

    async fn initiate_session(
        &self,
        conversation: &ConversationId,
        peer: &UserId,
    ) -> Result<SessionStatus, ManagerError<D, P>> {
        let bundle = match self.directory.fetch_prekey_bundle(peer).await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                debug!(%peer, "no prekey bundle published");
                return Ok(SessionStatus::Degraded(
                    DegradedReason::PrekeyBundleUnavailable,
                ));
            }
            Err(err) => {
                warn!(%peer, "could not fetch prekey bundle: {err}");
                return Ok(SessionStatus::Degraded(
                    DegradedReason::PrekeyBundleUnavailable,
                ));
            }
        };

        if bundle.onetime_prekey().is_none() {
            debug!(%peer, "no one-time prekey left, use signed prekey only");
        }

        let identity = self.key_store.load_identity().await?;
        let (y, offer) = match KeyExchange::initiate(
            conversation.clone(),
            &identity,
            &bundle,
            self.engine.as_ref(),
        ) {
            Ok(result) => result,
            Err(EstablishError::X3dh(X3dhError::KeyBundle(KeyBundleError::Signature(err)))) => {
                warn!(%peer, "invalid prekey signature: {err}");
                return Ok(SessionStatus::Degraded(
                    DegradedReason::InvalidPrekeySignature,
                ));
            }
            Err(EstablishError::X3dh(X3dhError::KeyBundle(KeyBundleError::Lifetime(err)))) => {
                warn!(%peer, "invalid prekey lifetime: {err}");
                return Ok(SessionStatus::Degraded(DegradedReason::ExpiredPrekey));
            }
            Err(err) => return Err(err.into()),
        };

        let key = KeyStore::<P, E>::session_key(conversation, peer);
        let exchange = PendingKeyExchange {
            conversation: conversation.clone(),
            initiator: self.user.clone(),
            responder: peer.clone(),
            offer,
            initiator_state: self.key_store.seal(&key, &y)?,
        };

        self.key_store.put_session(conversation, peer, &y).await?;

        if let Err(err) = self.directory.publish_key_exchange(&exchange).await {
            // Roll back, the peer can not derive the session without the exchange.
            if let Err(remove_err) = self.key_store.persistence().remove_blob(&key).await {
                warn!(%conversation, %peer, "could not remove unpublished session: {remove_err}");
            }
            return Err(ManagerError::Directory(err));
        }

        debug!(%conversation, %peer, "initiated key exchange");
        Ok(SessionStatus::Ready)
    }

    async fn accept_exchange(
        &self,
        exchange: &PendingKeyExchange,
    ) -> Result<(), ManagerError<D, P>> {
        let expected = self
            .directory
            .identity_key(&exchange.initiator)
            .await
            .map_err(ManagerError::Directory)?;
        if let Some(expected) = &expected {
            if expected != &exchange.offer.initiator_identity {
                return Err(EstablishError::IdentityMismatch.into());
            }
        }

        let identity = self.key_store.load_identity().await?;
        let prekey_secret = self
            .key_store
            .prekey_secret(&exchange.offer.signed_prekey_id)
            .await?;
        let onetime_secret = match exchange.offer.onetime_prekey_id {
            Some(id) => match self.key_store.use_onetime_secret(id).await {
                Ok(secret) => Some(secret),
                Err(KeyStoreError::KeyManager(KeyManagerError::UnknownOneTimeSecret(id))) => {
                    return Err(ManagerError::PreKeyReuse(id));
                }
                Err(err) => return Err(err.into()),
            },
            None => None,
        };

        let y = KeyExchange::accept(
            exchange.conversation.clone(),
            &exchange.offer,
            expected.as_ref(),
            &identity,
            &prekey_secret,
            onetime_secret.as_ref(),
            self.engine.as_ref(),
        )?;
        self.key_store
            .put_session(&exchange.conversation, &exchange.initiator, &y)
            .await?;
        debug!(
            conversation = %exchange.conversation,
            peer = %exchange.initiator,
            "accepted key exchange"
        );

        if let Err(err) = self
            .directory
            .accept_key_exchange(&exchange.conversation, &exchange.initiator, &self.user)
            .await
        {
            warn!("could not mark key exchange as accepted: {err}");
        }

        Ok(())
    }

    /// Returns true if a key exchange of the peer replaces our current session.
    ///
    /// When both sides initiated at the same time, the exchange of the smaller user id wins on
    /// both sides.
    fn yields_to(&self, existing: Option<&SessionState>, peer: &UserId) -> bool {
        match existing {
            None => true,
            Some(y) => {
                y.role() == Role::Initiator
                    && y.status() == RatchetStatus::AwaitingFirstMessage
                    && peer < &self.user
            }
        }
    }

    /// Removes our own outstanding exchange after the peer's one took precedence.
    async fn withdraw_exchange(&self, conversation: &ConversationId, peer: &UserId) {
        if let Err(err) = self
            .directory
            .accept_key_exchange(conversation, &self.user, peer)
            .await
        {
            warn!("could not withdraw own key exchange: {err}");
        }
    }

    /// Accepts the peer's exchange if it takes precedence over our current session, returns true
    /// when a new session was derived.
    async fn accept_pending(
        &self,
        conversation: &ConversationId,
        peer: &UserId,
    ) -> Result<bool, ManagerError<D, P>> {
        let existing = self.key_store.get_session(conversation, peer).await?;
        if !self.yields_to(existing.as_ref(), peer) {
            return Ok(false);
        }

        let exchanges = self
            .directory
            .key_exchanges(conversation, &self.user)
            .await
            .map_err(ManagerError::Directory)?;
        let Some(exchange) = exchanges
            .iter()
            .find(|exchange| &exchange.initiator == peer && exchange.responder == self.user)
        else {
            return Ok(false);
        };

        self.accept_exchange(exchange).await?;
        if existing.is_some() {
            self.withdraw_exchange(conversation, peer).await;
        }
        Ok(true)
    }

    async fn decrypt_direct(
        &self,
        conversation: &ConversationId,
        message: &DirectMessage,
    ) -> Result<Vec<u8>, ManagerError<D, P>> {
        let peer = &message.sender;
        let limits = self.config.ratchet_limits();

        let y = match self.key_store.get_session(conversation, peer).await? {
            Some(y) => y,
            None => {
                // Message arrived before we picked up the peer's key exchange.
                self.accept_pending(conversation, peer).await?;
                self.key_store
                    .get_session(conversation, peer)
                    .await?
                    .ok_or_else(|| ManagerError::NoSession(conversation.clone(), peer.clone()))?
            }
        };

        let crossed =
            y.status() == RatchetStatus::AwaitingFirstMessage && y.role() == Role::Initiator;
        let y = match Ratchet::decrypt(y, &message.message, &limits, self.engine.as_ref()) {
            Ok((y, body)) => {
                self.key_store.put_session(conversation, peer, &y).await?;
                return Ok(body);
            }
            Err(err) if crossed => {
                if !self.accept_pending(conversation, peer).await? {
                    return Err(err.into());
                }
                self.key_store
                    .get_session(conversation, peer)
                    .await?
                    .ok_or_else(|| ManagerError::NoSession(conversation.clone(), peer.clone()))?
            }
            Err(err) => return Err(err.into()),
        };

        let (y, body) = Ratchet::decrypt(y, &message.message, &limits, self.engine.as_ref())?;
        self.key_store.put_session(conversation, peer, &y).await?;
        Ok(body)
    }

    // Groups.

    /// Creates a group with us and the given members.
    ///
    /// Returns our sender chain and the conversation key, wrapped for every member.
    pub async fn create_group(
        &self,
        conversation: &ConversationId,
        members: &[UserId],
    ) -> Result<Vec<Outbound>, ManagerError<D, P>> {
        let _guard = self.lock(LockKey::conversation(conversation)).await;
        if self.registry().await?.contains_key(conversation) {
            return Err(ManagerError::ConversationExists(conversation.clone()));
        }

        let mut all_members: BTreeSet<UserId> = members.iter().cloned().collect();
        all_members.insert(self.user.clone());
        self.register(
            conversation,
            ConversationKind::Group {
                members: all_members.clone(),
            },
        )
        .await?;

        let engine = self.engine.as_ref();
        let identity = self.key_store.load_identity().await?;
        let y = SenderKey::create_chain(SenderKey::init(conversation.clone()), engine)?;
        let key = ConversationKey::generate(engine)?;

        let mut outbound = Vec::new();
        for member in all_members.iter().filter(|member| *member != &self.user) {
            let member_identity = self.identity_of(member).await?;
            let distribution =
                SenderKey::distribute(&y, &self.user, &identity, member, &member_identity, engine)?;
            outbound.push(Outbound::new(
                member.clone(),
                TransportEvent::SenderKeyDistribution(distribution),
            ));
            let wrapped = key.wrap(
                conversation,
                &self.user,
                &identity,
                member,
                &member_identity,
                engine,
            )?;
            outbound.push(Outbound::new(
                member.clone(),
                TransportEvent::ConversationKey(wrapped),
            ));
        }

        self.key_store.put_sender_keys(&y).await?;
        self.key_store
            .put_conversation_key(conversation, &key)
            .await?;

        debug!(%conversation, members = all_members.len(), "created group");
        Ok(outbound)
    }

    /// Joins a group we were added to: creates our own sender chain and wraps it for all existing
    /// members.
    pub async fn join_group(
        &self,
        conversation: &ConversationId,
        members: &[UserId],
    ) -> Result<Vec<Outbound>, ManagerError<D, P>> {
        let _guard = self.lock(LockKey::conversation(conversation)).await;

        let mut all_members: BTreeSet<UserId> = members.iter().cloned().collect();
        all_members.insert(self.user.clone());
        self.register(
            conversation,
            ConversationKind::Group {
                members: all_members.clone(),
            },
        )
        .await?;
        self.apply_pending_keys(conversation).await?;

        let engine = self.engine.as_ref();
        let y = self
            .key_store
            .sender_keys(conversation)
            .await?
            .unwrap_or_else(|| SenderKey::init(conversation.clone()));
        let y = match y.own_chain() {
            Some(_) => y,
            None => SenderKey::create_chain(y, engine)?,
        };

        let identity = self.key_store.load_identity().await?;
        let mut outbound = Vec::new();
        for member in all_members.iter().filter(|member| *member != &self.user) {
            let member_identity = self.identity_of(member).await?;
            let distribution =
                SenderKey::distribute(&y, &self.user, &identity, member, &member_identity, engine)?;
            outbound.push(Outbound::new(
                member.clone(),
                TransportEvent::SenderKeyDistribution(distribution),
            ));
        }

        self.key_store.put_sender_keys(&y).await?;

        debug!(%conversation, "joined group");
        Ok(outbound)
    }

    // Channels.

    /// Creates a channel and its key, storing the key wrapped for ourselves as membership
    /// record.
    pub async fn create_channel(&self, channel: &ConversationId) -> Result<(), ManagerError<D, P>> {
        let _guard = self.lock(LockKey::conversation(channel)).await;
        if self.registry().await?.contains_key(channel) {
            return Err(ManagerError::ConversationExists(channel.clone()));
        }

        self.register(
            channel,
            ConversationKind::Channel {
                members: BTreeSet::from([self.user.clone()]),
            },
        )
        .await?;

        let engine = self.engine.as_ref();
        let identity = self.key_store.load_identity().await?;
        let (ring, key_id) = ChannelKeys::create(ChannelKeys::init(channel.clone()), engine)?;
        let record = ChannelKeys::wrap(
            &ring,
            &self.user,
            &identity,
            &self.user,
            &identity.public_key(),
            engine,
        )?;

        self.key_store
            .persistence()
            .store_membership_record(&record)
            .await
            .map_err(ManagerError::Persistence)?;
        self.key_store.put_channel_keys(&ring).await?;
        self.key_store
            .put_conversation_key(channel, &ConversationKey::generate(engine)?)
            .await?;

        debug!(%channel, %key_id, "created channel");
        Ok(())
    }

    /// Registers us as member of a channel and tries to load the channel key from our membership
    /// record.
    ///
    /// Returns false when no key was shared with us yet.
    pub async fn join_channel(
        &self,
        channel: &ConversationId,
        members: &[UserId],
    ) -> Result<bool, ManagerError<D, P>> {
        let mut all_members: BTreeSet<UserId> = members.iter().cloned().collect();
        all_members.insert(self.user.clone());
        {
            let _guard = self.lock(LockKey::conversation(channel)).await;
            self.register(
                channel,
                ConversationKind::Channel {
                    members: all_members,
                },
            )
            .await?;
            self.apply_pending_keys(channel).await?;
        }
        self.load_channel_key(channel).await
    }

    /// Loads the channel key from our membership record on the persistence service.
    pub async fn load_channel_key(
        &self,
        channel: &ConversationId,
    ) -> Result<bool, ManagerError<D, P>> {
        let _guard = self.lock(LockKey::conversation(channel)).await;
        let ring = self.channel_ring(channel).await?;
        let ring = self.apply_membership_record(ring).await?;
        Ok(ring.current().is_some())
    }

    async fn channel_ring(
        &self,
        channel: &ConversationId,
    ) -> Result<ChannelKeyRing, ManagerError<D, P>> {
        Ok(self
            .key_store
            .channel_keys(channel)
            .await?
            .unwrap_or_else(|| ChannelKeys::init(channel.clone())))
    }

    async fn apply_membership_record(
        &self,
        ring: ChannelKeyRing,
    ) -> Result<ChannelKeyRing, ManagerError<D, P>> {
        let record = self
            .key_store
            .persistence()
            .membership_record(ring.channel(), &self.user)
            .await
            .map_err(ManagerError::Persistence)?;

        let Some(record) = record else {
            return Ok(ring);
        };
        if ring.contains(&record.key_id) {
            return Ok(ring);
        }

        // Before joining we have no member list to check against and rely on the persistence
        // service to only accept records written by members.
        let trusted = match self.conversation_kind(ring.channel()).await? {
            None => true,
            Some(ConversationKind::Channel { members }) => members.contains(&record.wrapped_by),
            Some(_) => false,
        };
        if !trusted {
            warn!(
                channel = %record.channel,
                wrapped_by = %record.wrapped_by,
                "ignore membership record wrapped by non-member"
            );
            return Ok(ring);
        }

        self.apply_channel_record(ring, &record).await
    }

    async fn apply_channel_record(
        &self,
        ring: ChannelKeyRing,
        record: &MembershipRecord,
    ) -> Result<ChannelKeyRing, ManagerError<D, P>> {
        if ring.contains(&record.key_id) {
            return Ok(ring);
        }

        let wrapper_identity = self.identity_of(&record.wrapped_by).await?;
        let identity = self.key_store.load_identity().await?;
        let ring = ChannelKeys::unwrap(
            ring,
            record,
            &wrapper_identity,
            &identity,
            self.engine.as_ref(),
        )?;
        self.key_store.put_channel_keys(&ring).await?;

        debug!(channel = %record.channel, key_id = %record.key_id, "received channel key");
        Ok(ring)
    }

    // Membership.

    /// Shares our key material of a group or channel with a new member.
    ///
    /// For groups this is our sender chain at its current iteration, the new member can not
    /// decrypt anything we sent before. For channels the key is stored as membership record of
    /// the new member and pushed to it.
    pub async fn on_membership_changed(
        &self,
        conversation: &ConversationId,
        new_member: &UserId,
    ) -> Result<Vec<Outbound>, ManagerError<D, P>> {
        if new_member == &self.user {
            return Ok(Vec::new());
        }

        let _guard = self.lock(LockKey::conversation(conversation)).await;
        let kind = self.conversation(conversation).await?;

        let engine = self.engine.as_ref();
        let identity = self.key_store.load_identity().await?;
        let member_identity = self.identity_of(new_member).await?;
        let mut outbound = Vec::new();

        match kind {
            ConversationKind::Direct { .. } => {
                return Err(ManagerError::ConversationKindMismatch(conversation.clone()));
            }
            ConversationKind::Group { .. } => {
                self.register(
                    conversation,
                    ConversationKind::Group {
                        members: BTreeSet::from([new_member.clone()]),
                    },
                )
                .await?;

                if let Some(y) = self.key_store.sender_keys(conversation).await? {
                    if y.own_chain().is_some() {
                        let distribution = SenderKey::distribute(
                            &y,
                            &self.user,
                            &identity,
                            new_member,
                            &member_identity,
                            engine,
                        )?;
                        outbound.push(Outbound::new(
                            new_member.clone(),
                            TransportEvent::SenderKeyDistribution(distribution),
                        ));
                    }
                }
            }
            ConversationKind::Channel { .. } => {
                self.register(
                    conversation,
                    ConversationKind::Channel {
                        members: BTreeSet::from([new_member.clone()]),
                    },
                )
                .await?;

                let ring = self.channel_ring(conversation).await?;
                if ring.current().is_some() {
                    let record = ChannelKeys::wrap(
                        &ring,
                        &self.user,
                        &identity,
                        new_member,
                        &member_identity,
                        engine,
                    )?;
                    self.key_store
                        .persistence()
                        .store_membership_record(&record)
                        .await
                        .map_err(ManagerError::Persistence)?;
                    outbound.push(Outbound::new(
                        new_member.clone(),
                        TransportEvent::ChannelKeyPush(record),
                    ));
                } else {
                    warn!(%conversation, "no channel key to share with {new_member}");
                }
            }
        }

        if let Some(key) = self.key_store.conversation_key(conversation).await? {
            let wrapped = key.wrap(
                conversation,
                &self.user,
                &identity,
                new_member,
                &member_identity,
                engine,
            )?;
            outbound.push(Outbound::new(
                new_member.clone(),
                TransportEvent::ConversationKey(wrapped),
            ));
        }

        Ok(outbound)
    }

    /// Removes a member from a group or channel.
    ///
    /// Neither sender chains nor channel keys are replaced. The removed member keeps being able
    /// to derive keys it received before.
    pub async fn on_member_removed(
        &self,
        conversation: &ConversationId,
        member: &UserId,
    ) -> Result<(), ManagerError<D, P>> {
        let conversation_id = conversation.clone();
        self.update_registry(|registry| {
            match registry.get_mut(&conversation_id) {
                Some(ConversationKind::Group { members })
                | Some(ConversationKind::Channel { members }) => {
                    members.remove(member);
                    Ok(())
                }
                Some(ConversationKind::Direct { .. }) => {
                    Err(ManagerError::ConversationKindMismatch(conversation_id.clone()))
                }
                None => Err(ManagerError::UnknownConversation(conversation_id.clone())),
            }
        })
        .await?;

        debug!(%conversation, %member, "member removed, keys stay in place");
        Ok(())
    }

    // Messages.

    /// Encrypts a message body for all members of the conversation.
    pub async fn encrypt_for_send(
        &self,
        conversation: &ConversationId,
        plaintext: &[u8],
    ) -> Result<Envelope, ManagerError<D, P>> {
        let engine = self.engine.as_ref();

        match self.conversation(conversation).await? {
            ConversationKind::Direct { peer } => {
                let _guard = self.lock(LockKey::session(conversation, &peer)).await;
                let y = self
                    .key_store
                    .get_session(conversation, &peer)
                    .await?
                    .ok_or_else(|| ManagerError::NoSession(conversation.clone(), peer.clone()))?;
                let (y, message) = Ratchet::encrypt(y, plaintext, engine)?;
                self.key_store.put_session(conversation, &peer, &y).await?;

                Ok(Envelope::Direct(DirectMessage {
                    sender: self.user.clone(),
                    message,
                }))
            }
            ConversationKind::Group { .. } => {
                let _guard = self.lock(LockKey::conversation(conversation)).await;
                let y = self.sender_keys(conversation).await?;
                let (y, message) = SenderKey::encrypt(y, &self.user, plaintext, engine)?;
                self.key_store.put_sender_keys(&y).await?;

                Ok(Envelope::Group(message))
            }
            ConversationKind::Channel { .. } => {
                let _guard = self.lock(LockKey::conversation(conversation)).await;
                let mut ring = self.channel_ring(conversation).await?;
                if ring.current().is_none() {
                    ring = self.apply_membership_record(ring).await?;
                }
                let message = ChannelKeys::encrypt(&ring, &self.user, plaintext, engine)?;

                Ok(Envelope::Channel(message))
            }
        }
    }

    /// Encrypts replacement content for an earlier message.
    ///
    /// Edits bypass the ratchet and sender chains, they are wrapped for every recipient's
    /// identity key instead and therefore not forward secret.
    pub async fn encrypt_edit(
        &self,
        conversation: &ConversationId,
        target: &MessageId,
        plaintext: &[u8],
    ) -> Result<Envelope, ManagerError<D, P>> {
        let kind = self.conversation(conversation).await?;

        let mut recipients = Vec::new();
        for member in kind.recipients(&self.user) {
            let identity = self.identity_of(&member).await?;
            recipients.push((member, identity));
        }

        let identity = self.key_store.load_identity().await?;
        let message = Edit::encrypt(
            conversation,
            &self.user,
            &identity,
            target,
            plaintext,
            &recipients,
            self.engine.as_ref(),
        )?;

        Ok(Envelope::Edit(message))
    }

    pub async fn decrypt_received(
        &self,
        conversation: &ConversationId,
        envelope: &Envelope,
    ) -> Result<Plaintext, ManagerError<D, P>> {
        let engine = self.engine.as_ref();

        match envelope {
            Envelope::Direct(message) => {
                let peer = &message.sender;
                let _guard = self.lock(LockKey::session(conversation, peer)).await;
                let kind = ConversationKind::Direct { peer: peer.clone() };
                if let Some(existing) = self.conversation_kind(conversation).await? {
                    if existing != kind {
                        return Err(ManagerError::ConversationKindMismatch(conversation.clone()));
                    }
                }

                let body = self.decrypt_direct(conversation, message).await?;
                self.register(conversation, kind).await?;
                Ok(Plaintext::Message {
                    sender: peer.clone(),
                    body,
                })
            }
            Envelope::Group(message) => {
                let _guard = self.lock(LockKey::conversation(conversation)).await;
                let y = self.sender_keys(conversation).await?;
                let (y, body) =
                    SenderKey::decrypt(y, message, &self.config.sender_key_limits(), engine)?;
                self.key_store.put_sender_keys(&y).await?;

                Ok(Plaintext::Message {
                    sender: message.sender.clone(),
                    body,
                })
            }
            Envelope::Channel(message) => {
                let _guard = self.lock(LockKey::conversation(conversation)).await;
                let mut ring = self.channel_ring(conversation).await?;
                if !ring.contains(&message.key_id) {
                    ring = self.apply_membership_record(ring).await?;
                }
                let body = ChannelKeys::decrypt(&ring, message, engine)?;

                Ok(Plaintext::Message {
                    sender: message.sender.clone(),
                    body,
                })
            }
            Envelope::Edit(message) => {
                let sender_identity = self.identity_of(&message.sender).await?;
                let identity = self.key_store.load_identity().await?;
                let body = Edit::decrypt(
                    conversation,
                    message,
                    &sender_identity,
                    &self.user,
                    &identity,
                    engine,
                )?;

                Ok(Plaintext::Edit {
                    sender: message.sender.clone(),
                    target: message.target.clone(),
                    body,
                })
            }
        }
    }

    async fn sender_keys(
        &self,
        conversation: &ConversationId,
    ) -> Result<SenderKeyState, ManagerError<D, P>> {
        self.key_store
            .sender_keys(conversation)
            .await?
            .ok_or_else(|| ManagerError::NoSenderKeys(conversation.clone()))
    }

    // Metadata.

    pub async fn encrypt_metadata(
        &self,
        conversation: &ConversationId,
        metadata: &ConversationMetadata,
    ) -> Result<AeadCiphertext, ManagerError<D, P>> {
        let key = self.conversation_key(conversation).await?;
        Ok(key.encrypt_metadata(conversation, metadata, self.engine.as_ref())?)
    }

    pub async fn decrypt_metadata(
        &self,
        conversation: &ConversationId,
        ciphertext: &AeadCiphertext,
    ) -> Result<ConversationMetadata, ManagerError<D, P>> {
        let key = self.conversation_key(conversation).await?;
        Ok(key.decrypt_metadata(conversation, ciphertext, self.engine.as_ref())?)
    }

    async fn conversation_key(
        &self,
        conversation: &ConversationId,
    ) -> Result<ConversationKey, ManagerError<D, P>> {
        self.key_store
            .conversation_key(conversation)
            .await?
            .ok_or_else(|| ManagerError::NoConversationKey(conversation.clone()))
    }

    // Transport events.

    /// Handles a notification of the realtime transport.
    pub async fn handle_event(
        &self,
        event: &TransportEvent,
    ) -> Result<EventOutcome, ManagerError<D, P>> {
        match event {
            TransportEvent::NewMessage {
                conversation,
                envelope,
            } => {
                let plaintext = self.decrypt_received(conversation, envelope).await?;
                Ok(EventOutcome::Decrypted {
                    conversation: conversation.clone(),
                    plaintext,
                })
            }
            TransportEvent::KeyExchange(exchange) => {
                if exchange.responder != self.user {
                    return Ok(EventOutcome::Ignored);
                }
                let status = self
                    .ensure_session(&exchange.conversation, &exchange.initiator)
                    .await?;
                Ok(EventOutcome::Session {
                    conversation: exchange.conversation.clone(),
                    peer: exchange.initiator.clone(),
                    status,
                })
            }
            TransportEvent::KeyExchangeAccepted {
                conversation,
                initiator,
                responder,
            } => {
                debug!(%conversation, %initiator, %responder, "key exchange accepted");
                Ok(EventOutcome::Ignored)
            }
            TransportEvent::MembershipChanged {
                conversation,
                change,
            } => match change {
                MembershipChange::Joined(member) => {
                    let outbound = self.on_membership_changed(conversation, member).await?;
                    Ok(EventOutcome::Outbound(outbound))
                }
                MembershipChange::Left(member) => {
                    self.on_member_removed(conversation, member).await?;
                    Ok(EventOutcome::Outbound(Vec::new()))
                }
            },
            TransportEvent::SenderKeyDistribution(distribution) => {
                if distribution.recipient != self.user {
                    return Ok(EventOutcome::Ignored);
                }
                let conversation = &distribution.conversation;
                let sender = &distribution.sender;
                let _guard = self.lock(LockKey::conversation(conversation)).await;

                match self.conversation_kind(conversation).await? {
                    None => {
                        return self
                            .defer_keys(conversation, |pending| {
                                pending.distributions.retain(|d| &d.sender != sender);
                                pending.distributions.push(distribution.clone());
                            })
                            .await;
                    }
                    Some(ConversationKind::Group { members }) if members.contains(sender) => {}
                    Some(ConversationKind::Group { .. }) => {
                        warn!(%conversation, %sender, "reject sender key of non-member");
                        return Err(ManagerError::NotAMember(
                            conversation.clone(),
                            sender.clone(),
                        ));
                    }
                    Some(_) => {
                        return Err(ManagerError::ConversationKindMismatch(conversation.clone()));
                    }
                }

                self.receive_distribution(distribution).await?;
                Ok(EventOutcome::KeysUpdated {
                    conversation: conversation.clone(),
                })
            }
            TransportEvent::ChannelKeyPush(record) => {
                if record.member != self.user {
                    return Ok(EventOutcome::Ignored);
                }
                let channel = &record.channel;
                let _guard = self.lock(LockKey::conversation(channel)).await;
                let ring = self.channel_ring(channel).await?;

                match self.conversation_kind(channel).await? {
                    Some(ConversationKind::Channel { members })
                        if members.contains(&record.wrapped_by) =>
                    {
                        self.apply_channel_record(ring, record).await?;
                    }
                    Some(ConversationKind::Channel { .. }) => {
                        warn!(
                            %channel,
                            wrapped_by = %record.wrapped_by,
                            "reject channel key of non-member"
                        );
                        return Err(ManagerError::NotAMember(
                            channel.clone(),
                            record.wrapped_by.clone(),
                        ));
                    }
                    Some(_) => {
                        return Err(ManagerError::ConversationKindMismatch(channel.clone()));
                    }
                    None => {
                        // Not joined yet, only the record stored for us on the persistence
                        // service counts.
                        let ring = self.apply_membership_record(ring).await?;
                        if !ring.contains(&record.key_id) {
                            return Err(ManagerError::NotAMember(
                                channel.clone(),
                                record.wrapped_by.clone(),
                            ));
                        }
                    }
                }

                Ok(EventOutcome::KeysUpdated {
                    conversation: channel.clone(),
                })
            }
            TransportEvent::ConversationKey(wrapped) => {
                if wrapped.member != self.user {
                    return Ok(EventOutcome::Ignored);
                }
                let conversation = &wrapped.conversation;
                let _guard = self.lock(LockKey::conversation(conversation)).await;

                match self.conversation_kind(conversation).await? {
                    None => {
                        return self
                            .defer_keys(conversation, |pending| {
                                pending
                                    .conversation_keys
                                    .retain(|w| w.wrapped_by != wrapped.wrapped_by);
                                pending.conversation_keys.push(wrapped.clone());
                            })
                            .await;
                    }
                    Some(kind) if kind.contains(&wrapped.wrapped_by) => {}
                    Some(_) => {
                        warn!(
                            %conversation,
                            wrapped_by = %wrapped.wrapped_by,
                            "reject conversation key of non-member"
                        );
                        return Err(ManagerError::NotAMember(
                            conversation.clone(),
                            wrapped.wrapped_by.clone(),
                        ));
                    }
                }

                self.receive_conversation_key(wrapped).await?;
                Ok(EventOutcome::KeysUpdated {
                    conversation: conversation.clone(),
                })
            }
        }
    }

    async fn receive_distribution(
        &self,
        distribution: &SenderKeyDistribution,
    ) -> Result<(), ManagerError<D, P>> {
        let conversation = &distribution.conversation;
        let sender_identity = self.identity_of(&distribution.sender).await?;
        let identity = self.key_store.load_identity().await?;
        let y = self
            .key_store
            .sender_keys(conversation)
            .await?
            .unwrap_or_else(|| SenderKey::init(conversation.clone()));
        let y = SenderKey::receive_distribution(
            y,
            distribution,
            &sender_identity,
            &identity,
            self.engine.as_ref(),
        )?;
        self.key_store.put_sender_keys(&y).await?;
        Ok(())
    }

    async fn receive_conversation_key(
        &self,
        wrapped: &WrappedConversationKey,
    ) -> Result<(), ManagerError<D, P>> {
        let conversation = &wrapped.conversation;

        // First key we learn about stays.
        if self.key_store.conversation_key(conversation).await?.is_some() {
            return Ok(());
        }

        let wrapper_identity = self.identity_of(&wrapped.wrapped_by).await?;
        let identity = self.key_store.load_identity().await?;
        let key = ConversationKey::unwrap(
            wrapped,
            &wrapper_identity,
            &identity,
            self.engine.as_ref(),
        )?;
        self.key_store
            .put_conversation_key(conversation, &key)
            .await?;
        Ok(())
    }

    async fn defer_keys(
        &self,
        conversation: &ConversationId,
        f: impl FnOnce(&mut PendingKeys),
    ) -> Result<EventOutcome, ManagerError<D, P>> {
        let key = BlobKey::PendingKeys(conversation.clone());
        let mut pending: PendingKeys = self.key_store.load(&key).await?.unwrap_or_default();
        f(&mut pending);
        self.key_store.store(&key, &pending).await?;

        debug!(%conversation, "deferred keys of a conversation we did not join");
        Ok(EventOutcome::Deferred {
            conversation: conversation.clone(),
        })
    }

    /// Applies key material which arrived before we joined, keeping only what members sent.
    ///
    /// Has to be called with the conversation registered and its lock held.
    async fn apply_pending_keys(
        &self,
        conversation: &ConversationId,
    ) -> Result<(), ManagerError<D, P>> {
        let key = BlobKey::PendingKeys(conversation.clone());
        let Some(pending) = self.key_store.load::<PendingKeys>(&key).await? else {
            return Ok(());
        };
        let kind = self.conversation(conversation).await?;

        for distribution in &pending.distributions {
            let sender = &distribution.sender;
            if !matches!(kind, ConversationKind::Group { .. }) || !kind.contains(sender) {
                warn!(%conversation, %sender, "discard sender key of non-member");
                continue;
            }
            if let Err(err) = self.receive_distribution(distribution).await {
                if err.kind() == ErrorKind::Transport {
                    return Err(err);
                }
                warn!(%conversation, %sender, "discard invalid sender key: {err}");
            }
        }

        for wrapped in &pending.conversation_keys {
            let wrapped_by = &wrapped.wrapped_by;
            if !kind.contains(wrapped_by) {
                warn!(%conversation, %wrapped_by, "discard conversation key of non-member");
                continue;
            }
            if let Err(err) = self.receive_conversation_key(wrapped).await {
                if err.kind() == ErrorKind::Transport {
                    return Err(err);
                }
                warn!(%conversation, %wrapped_by, "discard invalid conversation key: {err}");
            }
        }

        self.key_store
            .persistence()
            .remove_blob(&key)
            .await
            .map_err(ManagerError::Persistence)?;
        Ok(())
    }

    // Fingerprints.

    /// Safety fingerprint of our and the peer's identity, identical on both sides.
    pub async fn safety_fingerprint(&self, peer: &UserId) -> Result<String, ManagerError<D, P>> {
        let our_identity = self.identity().await?;
        let their_identity = self.identity_of(peer).await?;
        Ok(safety_fingerprint(&our_identity, &their_identity))
    }

    async fn identity_of(&self, user: &UserId) -> Result<IdentityKey, ManagerError<D, P>> {
        self.directory
            .identity_key(user)
            .await
            .map_err(ManagerError::Directory)?
            .ok_or_else(|| ManagerError::UnknownIdentity(user.clone()))
    }

    // Conversation registry.

    pub async fn conversation_kind(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationKind>, ManagerError<D, P>> {
        Ok(self.registry().await?.remove(conversation))
    }

    async fn conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<ConversationKind, ManagerError<D, P>> {
        self.conversation_kind(conversation)
            .await?
            .ok_or_else(|| ManagerError::UnknownConversation(conversation.clone()))
    }

    async fn registry(&self) -> Result<ConversationRegistry, ManagerError<D, P>> {
        Ok(self
            .key_store
            .load(&BlobKey::Conversations)
            .await?
            .unwrap_or_default())
    }

    /// Adds a conversation to the registry or merges members into an existing one of the same
    /// kind.
    async fn register(
        &self,
        conversation: &ConversationId,
        kind: ConversationKind,
    ) -> Result<(), ManagerError<D, P>> {
        self.update_registry(|registry| match registry.get_mut(conversation) {
            Some(existing) => {
                if existing.merge(kind) {
                    Ok(())
                } else {
                    Err(ManagerError::ConversationKindMismatch(conversation.clone()))
                }
            }
            None => {
                registry.insert(conversation.clone(), kind);
                Ok(())
            }
        })
        .await
    }

    async fn update_registry<T>(
        &self,
        f: impl FnOnce(&mut ConversationRegistry) -> Result<T, ManagerError<D, P>>,
    ) -> Result<T, ManagerError<D, P>> {
        let _guard = self.lock(LockKey::Registry).await;
        let mut registry = self.registry().await?;
        let output = f(&mut registry)?;
        self.key_store
            .store(&BlobKey::Conversations, &registry)
            .await?;
        Ok(output)
    }

    async fn lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Every holder and waiter keeps a clone, entries only referenced here are unused.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Error)]
pub enum ManagerError<D, P>
where
    D: Directory,
    P: Persistence,
{
    #[error("directory failed: {0}")]
    Directory(D::Error),

    #[error("persistence service failed: {0}")]
    Persistence(P::Error),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError<P>),

    #[error(transparent)]
    Establish(#[from] EstablishError),

    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    #[error(transparent)]
    SenderKey(#[from] SenderKeyError),

    #[error(transparent)]
    ChannelKey(#[from] ChannelKeyError),

    #[error(transparent)]
    ConversationKey(#[from] ConversationKeyError),

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("conversation {0} exists already")]
    ConversationExists(ConversationId),

    #[error("conversation {0} is of another kind")]
    ConversationKindMismatch(ConversationId),

    #[error("no session with {1} in conversation {0}")]
    NoSession(ConversationId, UserId),

    #[error("no sender keys for group {0}")]
    NoSenderKeys(ConversationId),

    #[error("no conversation key for {0}")]
    NoConversationKey(ConversationId),

    #[error("no identity key known for {0}")]
    UnknownIdentity(UserId),

    #[error("one-time prekey {0} was used before")]
    PreKeyReuse(OneTimePreKeyId),

    #[error("can not establish a session with {0}")]
    InvalidPeer(UserId),

    #[error("{1} is not a member of conversation {0}")]
    NotAMember(ConversationId, UserId),
}

impl<D, P> ManagerError<D, P>
where
    D: Directory,
    P: Persistence,
{
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::Directory(_) | ManagerError::Persistence(_) => ErrorKind::Transport,
            ManagerError::KeyStore(err) => err.kind(),
            ManagerError::Establish(err) => err.kind(),
            ManagerError::Ratchet(err) => err.kind(),
            ManagerError::SenderKey(err) => err.kind(),
            ManagerError::ChannelKey(err) => err.kind(),
            ManagerError::ConversationKey(err) => err.kind(),
            ManagerError::Edit(err) => err.kind(),
            ManagerError::UnknownConversation(_)
            | ManagerError::NoSession(_, _)
            | ManagerError::NoSenderKeys(_)
            | ManagerError::NoConversationKey(_)
            | ManagerError::UnknownIdentity(_) => ErrorKind::MissingKey,
            ManagerError::PreKeyReuse(_) | ManagerError::NotAMember(_, _) => {
                ErrorKind::Verification
            }
            ManagerError::ConversationExists(_)
            | ManagerError::ConversationKindMismatch(_)
            | ManagerError::InvalidPeer(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use murmur_core::ConversationId;

    use crate::test_utils::{MemoryDirectory, test_manager};

    #[tokio::test]
    async fn unused_locks_are_pruned() {
        let directory = MemoryDirectory::new();
        let alice = test_manager("alice", 1, &directory).await;
        let bob = test_manager("bob", 2, &directory).await;

        for i in 0..8 {
            let dm = ConversationId::new(&format!("dm-{i}")).unwrap();
            alice.ensure_session(&dm, bob.user()).await.unwrap();
            alice.encrypt_for_send(&dm, b"hello").await.unwrap();
        }

        // At most the session and registry locks of the last operation are left.
        assert!(alice.locks.lock().await.len() <= 2);
    }
}
