// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;

use assert_matches::assert_matches;
use murmur_core::{ConversationId, MessageId, UserId};

use crate::channel_key::ChannelKeyError;
use crate::conversation_key::ConversationMetadata;
use crate::crypto::{Crypto, CryptoEngine};
use crate::envelope::{Envelope, MembershipChange, Outbound, Plaintext, TransportEvent};
use crate::error::ErrorKind;
use crate::key_bundle::{Lifetime, PreKey, PublishedPrekeys};
use crate::key_store::KeyStoreError;
use crate::manager::{ConversationKind, DegradedReason, EventOutcome, ManagerError, SessionStatus};
use crate::sender_key::SenderKeyError;
use crate::session::{RatchetError, RatchetStatus, Role};
use crate::test_utils::{
    MemoryDirectory, MemoryPersistence, TestManager, setup_logging, test_config, test_device_key,
    test_manager, test_manager_with,
};
use crate::traits::Directory;
use crate::Manager;

fn conversation(id: &str) -> ConversationId {
    ConversationId::new(id).unwrap()
}

/// Hands every outbound event to the client it is addressed to.
async fn deliver(outbound: Vec<Outbound>, clients: &[&TestManager]) {
    for Outbound { recipient, event } in outbound {
        let client = clients
            .iter()
            .find(|client| client.user() == &recipient)
            .expect("recipient is part of the test");
        client.handle_event(&event).await.unwrap();
    }
}

async fn send(from: &TestManager, to: &TestManager, conversation: &ConversationId, body: &[u8]) {
    let envelope = from.encrypt_for_send(conversation, body).await.unwrap();
    let plaintext = to.decrypt_received(conversation, &envelope).await.unwrap();
    assert_eq!(plaintext.body(), body);
    assert_eq!(plaintext.sender(), from.user());
}

#[tokio::test]
async fn direct_conversation_without_onetime_prekey() {
    setup_logging();

    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    // Bob ran out of one-time prekeys, the handshake falls back to the signed prekey.
    directory.drain_onetime_prekeys(bob.user()).await;

    let status = alice.ensure_session(&dm, bob.user()).await.unwrap();
    assert_eq!(status, SessionStatus::Ready);
    assert_eq!(directory.pending_exchanges().await.len(), 1);

    let envelope = alice.encrypt_for_send(&dm, b"hello").await.unwrap();
    assert!(envelope.is_forward_secret());
    assert_eq!(
        bob.decrypt_received(&dm, &envelope).await.unwrap(),
        Plaintext::Message {
            sender: alice.user().clone(),
            body: b"hello".to_vec(),
        }
    );

    // Bob accepted the key exchange, it is gone from the directory.
    assert!(directory.pending_exchanges().await.is_empty());

    send(&bob, &alice, &dm, b"hi").await;
    send(&alice, &bob, &dm, b"how are you?").await;

    let session = alice
        .key_store()
        .get_session(&dm, bob.user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.role(), Role::Initiator);
    assert_eq!(session.status(), RatchetStatus::Ratcheting);
    assert_eq!(
        alice.conversation_kind(&dm).await.unwrap(),
        Some(ConversationKind::Direct {
            peer: bob.user().clone()
        })
    );

    // Established sessions are reused.
    assert_eq!(
        alice.ensure_session(&dm, bob.user()).await.unwrap(),
        SessionStatus::Ready
    );
}

#[tokio::test]
async fn onetime_prekeys_are_consumed() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    assert_eq!(directory.onetime_prekeys(bob.user()).await, 4);
    alice.ensure_session(&dm, bob.user()).await.unwrap();
    assert_eq!(directory.onetime_prekeys(bob.user()).await, 3);

    send(&alice, &bob, &dm, b"hello").await;
    assert_eq!(bob.key_store().onetime_prekeys_available().await.unwrap(), 3);

    // Maintenance tops the directory up again.
    bob.maintain_prekeys().await.unwrap();
    assert_eq!(directory.onetime_prekeys(bob.user()).await, 4);
}

#[tokio::test]
async fn responder_sends_first() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    alice.ensure_session(&dm, bob.user()).await.unwrap();

    // Bob learns about the key exchange through the transport.
    let exchange = directory.pending_exchanges().await.remove(0);
    let outcome = bob
        .handle_event(&TransportEvent::KeyExchange(exchange.clone()))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        EventOutcome::Session {
            conversation: dm.clone(),
            peer: alice.user().clone(),
            status: SessionStatus::Ready,
        }
    );

    // Alice ignores her own exchange.
    assert_eq!(
        alice
            .handle_event(&TransportEvent::KeyExchange(exchange))
            .await
            .unwrap(),
        EventOutcome::Ignored
    );

    send(&bob, &alice, &dm, b"hi first").await;
    send(&alice, &bob, &dm, b"hello").await;
}

#[tokio::test]
async fn replayed_message_fails() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    alice.ensure_session(&dm, bob.user()).await.unwrap();
    let envelope_1 = alice.encrypt_for_send(&dm, b"one").await.unwrap();
    let envelope_2 = alice.encrypt_for_send(&dm, b"two").await.unwrap();

    // Out of order delivery.
    let plaintext = bob.decrypt_received(&dm, &envelope_2).await.unwrap();
    assert_eq!(plaintext.body(), b"two");
    let plaintext = bob.decrypt_received(&dm, &envelope_1).await.unwrap();
    assert_eq!(plaintext.body(), b"one");

    let result = bob.decrypt_received(&dm, &envelope_1).await;
    assert_matches!(
        result,
        Err(ManagerError::Ratchet(RatchetError::MessageKeyUnavailable(0)))
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Verification);
}

/// Sending and receiving counters of the ratchet.
async fn counters(
    manager: &TestManager,
    conversation: &ConversationId,
    peer: &UserId,
) -> (u32, u32) {
    let session = manager
        .key_store()
        .get_session(conversation, peer)
        .await
        .unwrap()
        .unwrap();
    (session.send_count(), session.recv_count())
}

/// Starts a session from both sides, neither seeing the key exchange of the other in time.
async fn initiate_concurrently(
    alice: &TestManager,
    bob: &TestManager,
    directory: &MemoryDirectory,
    conversation: &ConversationId,
) {
    alice.ensure_session(conversation, bob.user()).await.unwrap();
    let delayed = directory.take_exchanges().await;
    bob.ensure_session(conversation, alice.user()).await.unwrap();
    for exchange in delayed {
        directory.publish_key_exchange(&exchange).await.unwrap();
    }
    assert_eq!(directory.pending_exchanges().await.len(), 2);
}

#[tokio::test]
async fn edits_bypass_the_ratchet() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    alice.ensure_session(&dm, bob.user()).await.unwrap();
    send(&alice, &bob, &dm, b"helo").await;
    send(&bob, &alice, &dm, b"hi").await;

    let alice_before = counters(&alice, &dm, bob.user()).await;
    let bob_before = counters(&bob, &dm, alice.user()).await;

    let target = MessageId::new("message-1").unwrap();
    let envelope = alice.encrypt_edit(&dm, &target, b"hello").await.unwrap();
    assert!(!envelope.is_forward_secret());
    assert_eq!(
        bob.decrypt_received(&dm, &envelope).await.unwrap(),
        Plaintext::Edit {
            sender: alice.user().clone(),
            target,
            body: b"hello".to_vec(),
        }
    );

    assert_eq!(counters(&alice, &dm, bob.user()).await, alice_before);
    assert_eq!(counters(&bob, &dm, alice.user()).await, bob_before);

    // Ratchet keeps working after the edit.
    send(&alice, &bob, &dm, b"still here").await;
}

#[tokio::test]
async fn crossing_initiations() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    initiate_concurrently(&alice, &bob, &directory, &dm).await;

    let from_alice = alice.encrypt_for_send(&dm, b"from alice").await.unwrap();
    let from_bob = bob.encrypt_for_send(&dm, b"from bob").await.unwrap();

    // "alice" is the smaller user id, her exchange wins on both sides.
    let plaintext = bob.decrypt_received(&dm, &from_alice).await.unwrap();
    assert_eq!(plaintext.body(), b"from alice");
    assert!(directory.pending_exchanges().await.is_empty());

    // Bob's message was sent in the session which lost.
    assert_matches!(
        alice.decrypt_received(&dm, &from_bob).await,
        Err(ManagerError::Ratchet(_))
    );

    send(&bob, &alice, &dm, b"from bob again").await;
    send(&alice, &bob, &dm, b"welcome back").await;

    let session = bob
        .key_store()
        .get_session(&dm, alice.user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.role(), Role::Responder);
}

#[tokio::test]
async fn crossing_initiations_resolved_on_ensure() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    initiate_concurrently(&alice, &bob, &directory, &dm).await;

    // Alice keeps her session, Bob replaces his with the one of Alice's exchange.
    alice.ensure_session(&dm, bob.user()).await.unwrap();
    bob.ensure_session(&dm, alice.user()).await.unwrap();
    assert!(directory.pending_exchanges().await.is_empty());

    send(&bob, &alice, &dm, b"hi").await;
    send(&alice, &bob, &dm, b"hello").await;
}

#[tokio::test]
async fn degraded_sessions() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let carol = test_manager("carol", 3, &directory).await;
    let engine = Crypto::from_seed([9; 32]);

    // Nobody published anything under this name.
    let nobody = UserId::new("nobody").unwrap();
    assert_eq!(
        alice
            .ensure_session(&conversation("dm-nobody"), &nobody)
            .await
            .unwrap(),
        SessionStatus::Degraded(DegradedReason::PrekeyBundleUnavailable)
    );

    // Signed prekey of Bob signed by Carol.
    let bob_identity = bob.key_store().load_identity().await.unwrap();
    let carol_identity = carol.key_store().load_identity().await.unwrap();
    let prekey = PreKey::new(
        engine.new_kem_secret().unwrap().public_key(),
        Lifetime::default(),
    );
    let forged = PublishedPrekeys {
        identity_key: bob_identity.public_key(),
        signed_prekey: prekey,
        prekey_signature: prekey.sign(carol_identity.signing_key(), &engine).unwrap(),
        onetime_prekeys: Vec::new(),
    };
    directory.publish_prekeys(bob.user(), &forged).await.unwrap();

    let dm = conversation("dm-bob");
    assert_eq!(
        alice.ensure_session(&dm, bob.user()).await.unwrap(),
        SessionStatus::Degraded(DegradedReason::InvalidPrekeySignature)
    );
    assert!(
        alice
            .key_store()
            .get_session(&dm, bob.user())
            .await
            .unwrap()
            .is_none()
    );
    assert_matches!(
        alice.encrypt_for_send(&dm, b"hello").await,
        Err(ManagerError::NoSession(_, _))
    );

    // Correctly signed, but expired.
    let prekey = PreKey::new(
        engine.new_kem_secret().unwrap().public_key(),
        Lifetime::from_range(0, 1),
    );
    let expired = PublishedPrekeys {
        identity_key: bob_identity.public_key(),
        signed_prekey: prekey,
        prekey_signature: prekey.sign(bob_identity.signing_key(), &engine).unwrap(),
        onetime_prekeys: Vec::new(),
    };
    directory.publish_prekeys(bob.user(), &expired).await.unwrap();
    assert_eq!(
        alice.ensure_session(&dm, bob.user()).await.unwrap(),
        SessionStatus::Degraded(DegradedReason::ExpiredPrekey)
    );

    // Valid prekeys again.
    bob.publish_prekeys().await.unwrap();
    assert_eq!(
        alice.ensure_session(&dm, bob.user()).await.unwrap(),
        SessionStatus::Ready
    );
    send(&alice, &bob, &dm, b"finally").await;
}

#[tokio::test]
async fn directory_offline() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    directory.set_offline(true).await;
    let result = alice.ensure_session(&dm, bob.user()).await;
    assert_matches!(result, Err(ManagerError::Directory(_)));
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);

    directory.set_offline(false).await;
    alice.ensure_session(&dm, bob.user()).await.unwrap();
    send(&alice, &bob, &dm, b"hello").await;

    // Established sessions stay usable while the directory is unreachable.
    directory.set_offline(true).await;
    assert_eq!(
        alice.ensure_session(&dm, bob.user()).await.unwrap(),
        SessionStatus::Ready
    );
    send(&bob, &alice, &dm, b"hi").await;
}

#[tokio::test]
async fn session_survives_restart() {
    let directory = MemoryDirectory::new();
    let persistence = MemoryPersistence::new();
    let alice = test_manager_with("alice", 1, 1, &directory, persistence.clone()).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");

    alice.ensure_session(&dm, bob.user()).await.unwrap();
    send(&alice, &bob, &dm, b"hello").await;
    send(&bob, &alice, &dm, b"hi").await;
    let identity = alice.identity().await.unwrap();
    drop(alice);

    let alice = test_manager_with("alice", 1, 11, &directory, persistence.clone()).await;
    assert_eq!(alice.identity().await.unwrap(), identity);
    send(&alice, &bob, &dm, b"back again").await;
    send(&bob, &alice, &dm, b"welcome").await;

    // Sealed state can not be opened with another device key.
    let result = Manager::init(
        alice.user().clone(),
        test_config(),
        directory.clone(),
        persistence,
        test_device_key(5),
        Crypto::from_seed([12; 32]),
    )
    .await;
    let Err(err) = result else {
        panic!("expected restart with wrong device key to fail");
    };
    assert_matches!(err, ManagerError::KeyStore(KeyStoreError::Seal(_)));
    assert_eq!(err.kind(), ErrorKind::Verification);
}

#[tokio::test]
async fn late_joiner_in_group() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let carol = test_manager("carol", 3, &directory).await;
    let group = conversation("group");
    let clients = [&alice, &bob, &carol];

    let outbound = alice
        .create_group(&group, &[bob.user().clone(), carol.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &clients).await;

    let outbound = bob
        .join_group(&group, &[alice.user().clone(), carol.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &clients).await;
    let outbound = carol
        .join_group(&group, &[alice.user().clone(), bob.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &clients).await;

    let message_0 = alice.encrypt_for_send(&group, b"zero").await.unwrap();
    let message_1 = alice.encrypt_for_send(&group, b"one").await.unwrap();
    for client in [&bob, &carol] {
        assert_eq!(client.decrypt_received(&group, &message_0).await.unwrap().body(), b"zero");
        assert_eq!(client.decrypt_received(&group, &message_1).await.unwrap().body(), b"one");
    }
    send(&bob, &carol, &group, b"from bob").await;
    send(&carol, &alice, &group, b"from carol").await;

    // Dave joins after Alice's chain reached iteration 2.
    let dave = test_manager("dave", 4, &directory).await;
    let clients = [&alice, &bob, &carol, &dave];
    for client in [&alice, &bob, &carol] {
        let event = TransportEvent::MembershipChanged {
            conversation: group.clone(),
            change: MembershipChange::Joined(dave.user().clone()),
        };
        let EventOutcome::Outbound(outbound) = client.handle_event(&event).await.unwrap() else {
            panic!("expected outbound events");
        };
        deliver(outbound, &clients).await;
    }
    let outbound = dave
        .join_group(
            &group,
            &[alice.user().clone(), bob.user().clone(), carol.user().clone()],
        )
        .await
        .unwrap();
    deliver(outbound, &clients).await;

    let message_2 = alice.encrypt_for_send(&group, b"two").await.unwrap();
    let Envelope::Group(ref group_message) = message_2 else {
        panic!("expected group message");
    };
    assert_eq!(group_message.iteration, 2);
    assert_eq!(dave.decrypt_received(&group, &message_2).await.unwrap().body(), b"two");

    // History stays unreadable for Dave.
    let result = dave.decrypt_received(&group, &message_0).await;
    assert_matches!(
        result,
        Err(ManagerError::SenderKey(SenderKeyError::MessageKeyUnavailable(0)))
    );

    send(&dave, &bob, &group, b"hello everyone").await;
    send(&dave, &alice, &group, b"hello alice").await;

    // Dave received the conversation key as well.
    let metadata = ConversationMetadata {
        name: Some("book club".into()),
        icon: None,
    };
    let ciphertext = alice.encrypt_metadata(&group, &metadata).await.unwrap();
    assert_eq!(dave.decrypt_metadata(&group, &ciphertext).await.unwrap(), metadata);
    assert_eq!(bob.decrypt_metadata(&group, &ciphertext).await.unwrap(), metadata);
}

#[tokio::test]
async fn group_errors() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let group = conversation("group");

    assert_matches!(
        alice.encrypt_for_send(&group, b"hello").await,
        Err(ManagerError::UnknownConversation(_))
    );

    let outbound = alice
        .create_group(&group, &[bob.user().clone()])
        .await
        .unwrap();
    assert_matches!(
        alice.create_group(&group, &[bob.user().clone()]).await,
        Err(ManagerError::ConversationExists(_))
    );
    assert_matches!(
        alice.ensure_session(&group, bob.user()).await,
        Err(ManagerError::ConversationKindMismatch(_))
    );

    // Message arrives before the sender key distribution.
    let message = alice.encrypt_for_send(&group, b"early").await.unwrap();
    let result = bob.decrypt_received(&group, &message).await;
    assert_matches!(result, Err(ManagerError::NoSenderKeys(_)));
    assert_eq!(result.unwrap_err().kind(), ErrorKind::MissingKey);

    // Keys arriving before Bob joined are held back.
    deliver(outbound, &[&alice, &bob]).await;
    assert_matches!(
        bob.decrypt_received(&group, &message).await,
        Err(ManagerError::NoSenderKeys(_))
    );

    // Once Bob joined the message can be decrypted.
    let outbound = bob.join_group(&group, &[alice.user().clone()]).await.unwrap();
    deliver(outbound, &[&alice, &bob]).await;
    assert_eq!(bob.decrypt_received(&group, &message).await.unwrap().body(), b"early");
    send(&bob, &alice, &group, b"hello").await;
}

#[tokio::test]
async fn removed_member_keeps_keys() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let carol = test_manager("carol", 3, &directory).await;
    let group = conversation("group");
    let clients = [&alice, &bob, &carol];

    let outbound = alice
        .create_group(&group, &[bob.user().clone(), carol.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &clients).await;
    for (client, others) in [(&bob, [&alice, &carol]), (&carol, [&alice, &bob])] {
        let others: Vec<UserId> = others.iter().map(|other| other.user().clone()).collect();
        let outbound = client.join_group(&group, &others).await.unwrap();
        deliver(outbound, &clients).await;
    }

    let event = TransportEvent::MembershipChanged {
        conversation: group.clone(),
        change: MembershipChange::Left(bob.user().clone()),
    };
    assert_eq!(
        alice.handle_event(&event).await.unwrap(),
        EventOutcome::Outbound(Vec::new())
    );
    let Some(ConversationKind::Group { members }) = alice.conversation_kind(&group).await.unwrap()
    else {
        panic!("expected group");
    };
    assert!(!members.contains(bob.user()));

    // No key rotation on removal, Bob can still follow Alice's chain.
    let envelope = alice.encrypt_for_send(&group, b"after removal").await.unwrap();
    assert_eq!(
        bob.decrypt_received(&group, &envelope).await.unwrap().body(),
        b"after removal"
    );
    assert_eq!(
        carol.decrypt_received(&group, &envelope).await.unwrap().body(),
        b"after removal"
    );
}

#[tokio::test]
async fn channel_key_fan_out() {
    let directory = MemoryDirectory::new();
    let server = MemoryPersistence::new();
    let alice = test_manager_with("alice", 1, 1, &directory, server.share_records()).await;
    let bob = test_manager_with("bob", 2, 2, &directory, server.share_records()).await;
    let carol = test_manager_with("carol", 3, 3, &directory, server.share_records()).await;
    let channel = conversation("channel");

    alice.create_channel(&channel).await.unwrap();
    assert_matches!(
        alice.create_channel(&channel).await,
        Err(ManagerError::ConversationExists(_))
    );
    let history = alice.encrypt_for_send(&channel, b"before bob").await.unwrap();

    // Bob is added, the channel key is stored as his membership record and pushed to him.
    let outbound = alice
        .on_membership_changed(&channel, bob.user())
        .await
        .unwrap();
    assert_eq!(outbound.len(), 2);
    let push = outbound
        .iter()
        .find(|outbound| matches!(outbound.event, TransportEvent::ChannelKeyPush(_)))
        .cloned()
        .unwrap();

    assert!(bob.join_channel(&channel, &[alice.user().clone()]).await.unwrap());

    // Push arriving after the key was loaded from the record changes nothing.
    for _ in 0..2 {
        assert_eq!(
            bob.handle_event(&push.event).await.unwrap(),
            EventOutcome::KeysUpdated {
                conversation: channel.clone()
            }
        );
    }

    // New members read the full history.
    assert_eq!(
        bob.decrypt_received(&channel, &history).await.unwrap().body(),
        b"before bob"
    );
    send(&bob, &alice, &channel, b"hi alice").await;

    // Carol was added but never received the push, her key is loaded on first decryption.
    alice
        .on_membership_changed(&channel, carol.user())
        .await
        .unwrap();
    let envelope = bob.encrypt_for_send(&channel, b"hi carol").await.unwrap();
    assert_eq!(
        carol.decrypt_received(&channel, &envelope).await.unwrap().body(),
        b"hi carol"
    );

    // Dave is not a member.
    let dave = test_manager_with("dave", 4, 4, &directory, server.share_records()).await;
    assert!(!dave.join_channel(&channel, &[]).await.unwrap());
    let result = dave.decrypt_received(&channel, &envelope).await;
    assert_matches!(
        result,
        Err(ManagerError::ChannelKey(ChannelKeyError::NoChannelKey))
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::MissingKey);
}

#[tokio::test]
async fn safety_fingerprint_matches() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let carol = test_manager("carol", 3, &directory).await;

    let fingerprint = alice.safety_fingerprint(bob.user()).await.unwrap();
    assert_eq!(fingerprint, bob.safety_fingerprint(alice.user()).await.unwrap());
    assert_ne!(fingerprint, alice.safety_fingerprint(carol.user()).await.unwrap());

    let groups: Vec<&str> = fingerprint.split(' ').collect();
    assert_eq!(groups.len(), 12);
    assert!(groups.iter().all(|group| group.len() == 5));

    assert_matches!(
        alice.safety_fingerprint(&UserId::new("nobody").unwrap()).await,
        Err(ManagerError::UnknownIdentity(_))
    );
}

#[tokio::test]
async fn channel_key_loaded_on_send() {
    let directory = MemoryDirectory::new();
    let server = MemoryPersistence::new();
    let alice = test_manager_with("alice", 1, 1, &directory, server.share_records()).await;
    let bob = test_manager_with("bob", 2, 2, &directory, server.share_records()).await;
    let channel = conversation("channel");

    alice.create_channel(&channel).await.unwrap();
    assert!(!bob.join_channel(&channel, &[alice.user().clone()]).await.unwrap());

    // Bob is added, but the push never reaches him.
    alice
        .on_membership_changed(&channel, bob.user())
        .await
        .unwrap();
    send(&bob, &alice, &channel, b"first message").await;
}

#[tokio::test]
async fn channel_keys_of_non_members_are_rejected() {
    let directory = MemoryDirectory::new();
    let server = MemoryPersistence::new();
    let alice = test_manager_with("alice", 1, 1, &directory, server.share_records()).await;
    let bob = test_manager_with("bob", 2, 2, &directory, server.share_records()).await;
    let carol = test_manager_with("carol", 3, 3, &directory, server.share_records()).await;
    let mallory = test_manager("mallory", 4, &directory).await;
    let channel = conversation("channel");

    alice.create_channel(&channel).await.unwrap();
    alice
        .on_membership_changed(&channel, bob.user())
        .await
        .unwrap();
    assert!(bob.join_channel(&channel, &[alice.user().clone()]).await.unwrap());

    // Mallory creates her own key for the same channel and hands it to Bob.
    mallory.create_channel(&channel).await.unwrap();
    let outbound = mallory
        .on_membership_changed(&channel, bob.user())
        .await
        .unwrap();
    assert_eq!(outbound.len(), 2);
    for Outbound { event, .. } in outbound {
        let result = bob.handle_event(&event).await;
        assert_matches!(
            result,
            Err(ManagerError::NotAMember(_, ref user)) if user == mallory.user()
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Verification);
    }

    let Some(ConversationKind::Channel { members }) =
        bob.conversation_kind(&channel).await.unwrap()
    else {
        panic!("expected channel");
    };
    assert!(!members.contains(mallory.user()));

    // Bob keeps using the key Alice shared.
    send(&bob, &alice, &channel, b"secret plans").await;
    let envelope = bob.encrypt_for_send(&channel, b"more plans").await.unwrap();
    assert_matches!(
        mallory.decrypt_received(&channel, &envelope).await,
        Err(ManagerError::ChannelKey(ChannelKeyError::NoChannelKey))
    );

    // Carol did not join yet, Mallory's push has no record on the server to back it.
    let outbound = mallory
        .on_membership_changed(&channel, carol.user())
        .await
        .unwrap();
    for Outbound { event, .. } in outbound {
        match &event {
            TransportEvent::ChannelKeyPush(_) => assert_matches!(
                carol.handle_event(&event).await,
                Err(ManagerError::NotAMember(_, _))
            ),
            _ => assert_eq!(
                carol.handle_event(&event).await.unwrap(),
                EventOutcome::Deferred {
                    conversation: channel.clone()
                }
            ),
        }
    }
    assert_eq!(carol.conversation_kind(&channel).await.unwrap(), None);

    // Mallory's conversation key is dropped when Carol joins, Alice's one is used.
    assert!(!carol.join_channel(&channel, &[alice.user().clone()]).await.unwrap());
    let outbound = alice
        .on_membership_changed(&channel, carol.user())
        .await
        .unwrap();
    deliver(outbound, &[&carol]).await;

    let metadata = ConversationMetadata {
        name: Some("plans".into()),
        icon: None,
    };
    let ciphertext = alice.encrypt_metadata(&channel, &metadata).await.unwrap();
    assert_eq!(carol.decrypt_metadata(&channel, &ciphertext).await.unwrap(), metadata);
    send(&carol, &bob, &channel, b"hi bob").await;
}

#[tokio::test]
async fn group_keys_of_non_members_are_rejected() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let carol = test_manager("carol", 3, &directory).await;
    let mallory = test_manager("mallory", 4, &directory).await;
    let group = conversation("group");

    let outbound = alice
        .create_group(&group, &[bob.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &[&bob]).await;
    let outbound = bob.join_group(&group, &[alice.user().clone()]).await.unwrap();
    deliver(outbound, &[&alice]).await;

    // Mallory adds Alice to a group of her own with the same id.
    let outbound = mallory
        .create_group(&group, &[alice.user().clone()])
        .await
        .unwrap();
    assert_eq!(outbound.len(), 2);
    for Outbound { event, .. } in outbound {
        let result = alice.handle_event(&event).await;
        assert_matches!(
            result,
            Err(ManagerError::NotAMember(_, ref user)) if user == mallory.user()
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Verification);
    }

    let injected = mallory.encrypt_for_send(&group, b"injected").await.unwrap();
    assert_matches!(
        alice.decrypt_received(&group, &injected).await,
        Err(ManagerError::SenderKey(SenderKeyError::UnknownSender(_)))
    );
    assert_eq!(
        alice.conversation_kind(&group).await.unwrap(),
        Some(ConversationKind::Group {
            members: BTreeSet::from([alice.user().clone(), bob.user().clone()]),
        })
    );
    send(&bob, &alice, &group, b"still private").await;

    // Carol's invitations arrive before she joins, Mallory's one is dropped on joining.
    let outbound = mallory
        .on_membership_changed(&group, carol.user())
        .await
        .unwrap();
    for Outbound { event, .. } in outbound {
        assert_eq!(
            carol.handle_event(&event).await.unwrap(),
            EventOutcome::Deferred {
                conversation: group.clone()
            }
        );
    }
    for member in [&alice, &bob] {
        let outbound = member
            .on_membership_changed(&group, carol.user())
            .await
            .unwrap();
        deliver(outbound, &[&carol]).await;
    }
    let outbound = carol
        .join_group(&group, &[alice.user().clone(), bob.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &[&alice, &bob]).await;

    assert_matches!(
        carol.decrypt_received(&group, &injected).await,
        Err(ManagerError::SenderKey(SenderKeyError::UnknownSender(_)))
    );
    send(&alice, &carol, &group, b"welcome carol").await;
    send(&carol, &bob, &group, b"thanks").await;
}

#[tokio::test]
async fn failed_persist_does_not_advance_state() {
    let directory = MemoryDirectory::new();
    let persistence = MemoryPersistence::new();
    let alice = test_manager_with("alice", 1, 1, &directory, persistence.clone()).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");
    let group = conversation("group");

    alice.ensure_session(&dm, bob.user()).await.unwrap();
    send(&alice, &bob, &dm, b"hello").await;
    let outbound = alice
        .create_group(&group, &[bob.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &[&bob]).await;
    bob.join_group(&group, &[alice.user().clone()]).await.unwrap();

    let before = counters(&alice, &dm, bob.user()).await;
    persistence.set_read_only(true).await;

    let result = alice.encrypt_for_send(&dm, b"lost").await;
    assert_matches!(
        result,
        Err(ManagerError::KeyStore(KeyStoreError::Persistence(_)))
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
    assert_eq!(counters(&alice, &dm, bob.user()).await, before);

    let result = alice.encrypt_for_send(&group, b"lost").await;
    assert_matches!(
        result,
        Err(ManagerError::KeyStore(KeyStoreError::Persistence(_)))
    );

    // Retrying after the service recovered reuses the positions of the failed attempts.
    persistence.set_read_only(false).await;
    let envelope = alice.encrypt_for_send(&dm, b"retry").await.unwrap();
    let Envelope::Direct(ref message) = envelope else {
        panic!("expected direct message");
    };
    assert_eq!(message.message.header.counter, before.0);
    assert_eq!(bob.decrypt_received(&dm, &envelope).await.unwrap().body(), b"retry");

    let envelope = alice.encrypt_for_send(&group, b"retry").await.unwrap();
    let Envelope::Group(ref message) = envelope else {
        panic!("expected group message");
    };
    assert_eq!(message.iteration, 0);
    assert_eq!(bob.decrypt_received(&group, &envelope).await.unwrap().body(), b"retry");
}

#[tokio::test]
async fn concurrent_sends_are_serialized() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let dm = conversation("dm");
    let group = conversation("group");

    alice.ensure_session(&dm, bob.user()).await.unwrap();
    let (first, second) = tokio::join!(
        alice.encrypt_for_send(&dm, b"first"),
        alice.encrypt_for_send(&dm, b"second"),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    let (Envelope::Direct(message_1), Envelope::Direct(message_2)) = (&first, &second) else {
        panic!("expected direct messages");
    };
    assert_ne!(message_1.message.header.counter, message_2.message.header.counter);
    assert_eq!(bob.decrypt_received(&dm, &first).await.unwrap().body(), b"first");
    assert_eq!(bob.decrypt_received(&dm, &second).await.unwrap().body(), b"second");

    let outbound = alice
        .create_group(&group, &[bob.user().clone()])
        .await
        .unwrap();
    deliver(outbound, &[&bob]).await;
    bob.join_group(&group, &[alice.user().clone()]).await.unwrap();

    let (first, second) = tokio::join!(
        alice.encrypt_for_send(&group, b"first"),
        alice.encrypt_for_send(&group, b"second"),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    let (Envelope::Group(message_1), Envelope::Group(message_2)) = (&first, &second) else {
        panic!("expected group messages");
    };
    assert_ne!(message_1.iteration, message_2.iteration);
    assert_eq!(bob.decrypt_received(&group, &first).await.unwrap().body(), b"first");
    assert_eq!(bob.decrypt_received(&group, &second).await.unwrap().body(), b"second");
}

#[tokio::test]
async fn failed_decryption_registers_nothing() {
    let directory = MemoryDirectory::new();
    let alice = test_manager("alice", 1, &directory).await;
    let bob = test_manager("bob", 2, &directory).await;
    let carol = test_manager("carol", 3, &directory).await;
    let dm = conversation("dm");

    alice.ensure_session(&dm, bob.user()).await.unwrap();
    let envelope = alice.encrypt_for_send(&dm, b"for bob").await.unwrap();

    assert_matches!(
        carol.decrypt_received(&dm, &envelope).await,
        Err(ManagerError::NoSession(_, _))
    );
    assert_eq!(carol.conversation_kind(&dm).await.unwrap(), None);

    bob.decrypt_received(&dm, &envelope).await.unwrap();
    assert_eq!(
        bob.conversation_kind(&dm).await.unwrap(),
        Some(ConversationKind::Direct {
            peer: alice.user().clone()
        })
    );
}
