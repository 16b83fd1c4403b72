//! End-to-end editing between collaborators on an in-process network.
//!
//! Every test wires real `Collaborator`s to a `MemoryNetwork` and drives
//! delivery explicitly with `deliver_all`, so message interleavings are
//! deterministic.

use std::sync::Arc;

use tandem_collab::{
    CollabConfig, CollabError, Collaborator, ConflictNotice, ConflictPolicy, CollaborationRoom,
    MemoryNetwork, PresenceStatus, Resolution, RoomDirectory, UserProfile,
};
use tandem_core::{Position, SessionId, TextRange};

const FILE: &str = "src/main.rs";

struct Team {
    net: Arc<MemoryNetwork>,
    alice: Arc<Collaborator>,
    bob: Arc<Collaborator>,
    session_id: SessionId,
}

fn collaborator(net: &Arc<MemoryNetwork>, rooms: &Arc<RoomDirectory>, name: &str) -> Arc<Collaborator> {
    let c = Collaborator::new(
        UserProfile::new(name),
        CollabConfig::for_testing(),
        net.clone(),
        rooms.clone(),
    );
    net.connect(c.id(), c.clone());
    c
}

async fn introduce(a: &Collaborator, b: &Collaborator) {
    a.register_user(b.profile().clone()).await;
    b.register_user(a.profile().clone()).await;
}

/// Alice hosts a session on FILE with `base`; Bob joins.
async fn team_with_rooms(base: &str, rooms: Arc<RoomDirectory>) -> Team {
    let net = MemoryNetwork::new();
    let alice = collaborator(&net, &rooms, "alice");
    let bob = collaborator(&net, &rooms, "bob");
    introduce(&alice, &bob).await;

    alice.open_document(FILE, base).await;
    let session = alice.start_session(FILE, &[bob.id()]).await.unwrap();
    net.deliver_all().await;
    bob.join_session(session.id).await.unwrap();
    net.deliver_all().await;

    Team {
        net,
        alice,
        bob,
        session_id: session.id,
    }
}

async fn team(base: &str) -> Team {
    team_with_rooms(base, Arc::new(RoomDirectory::new())).await
}

fn span(start_col: u32, end_col: u32) -> TextRange {
    TextRange::from_coords(1, start_col, 1, end_col)
}

async fn assert_converged(t: &Team) -> String {
    let a = t.alice.document_text(FILE).await.unwrap();
    let b = t.bob.document_text(FILE).await.unwrap();
    assert_eq!(a, b, "replicas diverged");
    a
}

#[tokio::test]
async fn test_joiner_sees_base_content() {
    let t = team("fn main() {}").await;
    assert_eq!(t.bob.document_text(FILE).await.unwrap(), "fn main() {}");
    let session = t.bob.session(t.session_id).await.unwrap();
    assert!(session.is_participant(t.alice.id()));
    assert!(session.is_participant(t.bob.id()));
}

#[tokio::test]
async fn test_disjoint_concurrent_inserts_converge() {
    let t = team("hello world").await;

    t.alice.insert(FILE, Position::START, "A").await.unwrap();
    t.bob.insert(FILE, Position::new(1, 12), "B").await.unwrap();
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "Ahello worldB");
    assert!(t.alice.pending_conflicts().await.is_empty());
    assert!(t.bob.pending_conflicts().await.is_empty());
}

#[tokio::test]
async fn test_sequential_edits_replicate() {
    let t = team("").await;

    t.alice.insert(FILE, Position::START, "let x = 1;").await.unwrap();
    t.net.deliver_all().await;
    t.bob.replace(FILE, span(9, 10), "2").await.unwrap();
    t.net.deliver_all().await;
    t.alice.delete(FILE, span(1, 5)).await.unwrap();
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "x = 2;");
}

#[tokio::test]
async fn test_change_events_carry_origin() {
    let t = team("").await;
    let mut alice_changes = t.alice.subscribe_changes();
    let mut bob_changes = t.bob.subscribe_changes();

    let op = t.alice.insert(FILE, Position::START, "hi").await.unwrap();
    t.net.deliver_all().await;

    let local = alice_changes.try_recv().unwrap();
    assert_eq!(local.operation.id(), op.id());
    assert_eq!(local.origin, tandem_collab::ChangeOrigin::Local);
    let remote = bob_changes.try_recv().unwrap();
    assert_eq!(remote.operation.id(), op.id());
    assert_eq!(remote.origin, tandem_collab::ChangeOrigin::Remote);
}

/// Alice inserts "foo" at the start while Bob deletes everything: both hold
/// the other's operation back as a conflict.
async fn conflicting_edits(t: &Team) {
    t.alice.insert(FILE, Position::START, "foo").await.unwrap();
    t.bob.delete(FILE, span(1, 4)).await.unwrap();
    t.net.deliver_all().await;
}

#[tokio::test]
async fn test_overlapping_edits_conflict_on_both_sides() {
    let t = team("abc").await;
    let mut conflicts = t.bob.subscribe_conflicts();

    conflicting_edits(&t).await;

    assert_eq!(t.alice.pending_conflicts().await.len(), 1);
    assert_eq!(t.bob.pending_conflicts().await.len(), 1);
    // Held back: neither side applied the other's operation.
    assert_eq!(t.alice.document_text(FILE).await.unwrap(), "fooabc");
    assert_eq!(t.bob.document_text(FILE).await.unwrap(), "");
    assert!(matches!(conflicts.try_recv().unwrap(), ConflictNotice::Detected(_)));
}

#[tokio::test]
async fn test_merge_resolution_converges() {
    let t = team("abc").await;
    conflicting_edits(&t).await;

    let conflict = t.alice.pending_conflicts().await.remove(0);
    let correction = t
        .alice
        .resolve_conflict(conflict.id, Resolution::Merge, Some("foo".into()))
        .await
        .unwrap();
    assert!(correction.is_some_and(|op| op.is_correction()));
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "foo");
    assert!(t.alice.pending_conflicts().await.is_empty());
    assert!(t.bob.pending_conflicts().await.is_empty());

    let settled = t.alice.conflict(conflict.id).await.unwrap();
    assert!(settled.is_resolved());
    assert_eq!(settled.resolution, Some(Resolution::Merge));
}

#[tokio::test]
async fn test_local_resolution_keeps_local_edit_everywhere() {
    let t = team("abc").await;
    conflicting_edits(&t).await;

    let conflict = t.alice.pending_conflicts().await.remove(0);
    let correction = t
        .alice
        .resolve_conflict(conflict.id, Resolution::Local, None)
        .await
        .unwrap();
    assert!(correction.is_none());
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "fooabc");
    assert!(t.bob.pending_conflicts().await.is_empty());
}

#[tokio::test]
async fn test_remote_resolution_takes_peer_edit() {
    let t = team("abc").await;
    conflicting_edits(&t).await;

    let conflict = t.alice.pending_conflicts().await.remove(0);
    t.alice
        .resolve_conflict(conflict.id, Resolution::Remote, None)
        .await
        .unwrap();
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "");
}

/// Bob keeps typing at the start of the contested region while the
/// conflict is still pending on both sides.
async fn conflicting_edits_then_typing(t: &Team) {
    conflicting_edits(t).await;
    t.bob.insert(FILE, Position::START, "Z").await.unwrap();
    t.net.deliver_all().await;
    // Same-point inserts are ordered by author id.
    let alice_text = t.alice.document_text(FILE).await.unwrap();
    assert!(matches!(alice_text.as_str(), "Zfooabc" | "fooZabc"), "{alice_text}");
    assert_eq!(t.bob.document_text(FILE).await.unwrap(), "Z");
}

#[tokio::test]
async fn test_merge_after_typing_in_region_converges() {
    let t = team("abc").await;
    conflicting_edits_then_typing(&t).await;

    let conflict = t.alice.pending_conflicts().await.remove(0);
    t.alice
        .resolve_conflict(conflict.id, Resolution::Merge, Some("foo".into()))
        .await
        .unwrap();
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "foo");
    assert!(t.alice.pending_conflicts().await.is_empty());
    assert!(t.bob.pending_conflicts().await.is_empty());
}

#[tokio::test]
async fn test_local_resolution_after_typing_in_region_converges() {
    let t = team("abc").await;
    conflicting_edits_then_typing(&t).await;

    let conflict = t.alice.pending_conflicts().await.remove(0);
    let correction = t
        .alice
        .resolve_conflict(conflict.id, Resolution::Local, None)
        .await
        .unwrap();
    assert!(correction.is_some_and(|op| op.is_correction()));
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "fooabc");
    assert!(t.bob.pending_conflicts().await.is_empty());
}

#[tokio::test]
async fn test_resolving_twice_is_rejected() {
    let t = team("abc").await;
    conflicting_edits(&t).await;

    let conflict = t.alice.pending_conflicts().await.remove(0);
    t.alice
        .resolve_conflict(conflict.id, Resolution::Remote, None)
        .await
        .unwrap();
    let before = t.alice.document_text(FILE).await.unwrap();

    let again = t
        .alice
        .resolve_conflict(conflict.id, Resolution::Local, None)
        .await;
    assert!(matches!(again, Err(CollabError::AlreadyResolved(id)) if id == conflict.id));
    assert_eq!(t.alice.document_text(FILE).await.unwrap(), before);
}

#[tokio::test]
async fn test_merge_requires_content_and_unknown_conflict_fails() {
    let t = team("abc").await;
    conflicting_edits(&t).await;

    let conflict = t.alice.pending_conflicts().await.remove(0);
    assert!(matches!(
        t.alice.resolve_conflict(conflict.id, Resolution::Merge, None).await,
        Err(CollabError::MergeContentRequired)
    ));
    assert_eq!(t.alice.pending_conflicts().await.len(), 1);

    let unknown = uuid::Uuid::new_v4();
    assert!(matches!(
        t.alice.resolve_conflict(unknown, Resolution::Local, None).await,
        Err(CollabError::ConflictNotFound(_))
    ));
}

#[tokio::test]
async fn test_latest_wins_policy_resolves_automatically() {
    let rooms = Arc::new(RoomDirectory::new());
    let net = MemoryNetwork::new();
    let alice = collaborator(&net, &rooms, "alice");
    let bob = collaborator(&net, &rooms, "bob");
    introduce(&alice, &bob).await;
    let room = CollaborationRoom::new(alice.id(), "core", true).with_policy(ConflictPolicy::LatestWins);
    let room_id = rooms.create_room(room).await;
    rooms.add_file(room_id, alice.id(), FILE).await.unwrap();

    alice.open_document(FILE, "abc").await;
    let session = alice.start_session(FILE, &[bob.id()]).await.unwrap();
    net.deliver_all().await;
    bob.join_session(session.id).await.unwrap();
    net.deliver_all().await;
    let t = Team {
        net,
        alice,
        bob,
        session_id: session.id,
    };

    let insert = t.alice.insert(FILE, Position::START, "X").await.unwrap();
    let delete = t.bob.delete(FILE, span(1, 4)).await.unwrap();
    t.net.deliver_all().await;

    let expected = if insert.precedence() > delete.precedence() {
        "Xabc"
    } else {
        ""
    };
    assert_eq!(assert_converged(&t).await, expected);
    assert!(t.alice.pending_conflicts().await.is_empty());
    assert!(t.bob.pending_conflicts().await.is_empty());
}

#[tokio::test]
async fn test_earliest_position_policy_from_config() {
    let rooms = Arc::new(RoomDirectory::new());
    let net = MemoryNetwork::new();
    let config = CollabConfig {
        conflict_policy: ConflictPolicy::EarliestPositionWins,
        ..CollabConfig::for_testing()
    };
    let make = |name: &str| {
        let c = Collaborator::new(UserProfile::new(name), config.clone(), net.clone(), rooms.clone());
        net.connect(c.id(), c.clone());
        c
    };
    let alice = make("alice");
    let bob = make("bob");
    introduce(&alice, &bob).await;

    alice.open_document(FILE, "abc").await;
    let session = alice.start_session(FILE, &[bob.id()]).await.unwrap();
    net.deliver_all().await;
    bob.join_session(session.id).await.unwrap();
    net.deliver_all().await;
    let t = Team {
        net,
        alice,
        bob,
        session_id: session.id,
    };

    // Bob's delete starts first, so it wins on both sides.
    t.alice.insert(FILE, Position::new(1, 3), "X").await.unwrap();
    t.bob.delete(FILE, span(1, 4)).await.unwrap();
    t.net.deliver_all().await;

    assert_eq!(assert_converged(&t).await, "");
    assert!(t.alice.pending_conflicts().await.is_empty());
    assert!(t.bob.pending_conflicts().await.is_empty());
}

#[tokio::test]
async fn test_undo_and_redo_replicate() {
    let t = team("").await;

    t.alice.insert(FILE, Position::START, "hello").await.unwrap();
    t.net.deliver_all().await;
    t.bob.insert(FILE, Position::new(1, 6), "!").await.unwrap();
    t.net.deliver_all().await;

    assert!(t.alice.undo(FILE).await.unwrap().is_some());
    t.net.deliver_all().await;
    assert_eq!(assert_converged(&t).await, "!");

    assert!(t.alice.redo(FILE).await.unwrap().is_some());
    t.net.deliver_all().await;
    assert_eq!(assert_converged(&t).await, "hello!");

    assert!(t.alice.redo(FILE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_partition_buffers_then_pull_and_push_recover() {
    let t = team("").await;
    t.net.partition(t.alice.id(), t.bob.id());

    let first = t.alice.insert(FILE, Position::START, "hello").await.unwrap();
    let second = t.alice.insert(FILE, Position::new(1, 6), " world").await.unwrap();
    assert_eq!(t.alice.outbox_len(FILE).await, 2);
    assert!(matches!(
        t.bob.pull_changes(FILE).await,
        Err(CollabError::NoReachablePeer(_))
    ));
    assert_eq!(t.alice.push_changes(FILE).await.unwrap(), 0);
    assert_eq!(t.alice.outbox_len(FILE).await, 2);

    t.net.heal();
    let missing = t.bob.pull_changes(FILE).await.unwrap();
    let ids: Vec<_> = missing.iter().map(|op| op.id()).collect();
    assert_eq!(ids, vec![first.id(), second.id()]);
    // Pulling alone changes nothing.
    assert_eq!(t.bob.document_text(FILE).await.unwrap(), "");

    assert_eq!(t.bob.catch_up(FILE).await.unwrap(), 2);
    assert_eq!(t.bob.document_text(FILE).await.unwrap(), "hello world");

    assert_eq!(t.alice.push_changes(FILE).await.unwrap(), 2);
    assert_eq!(t.alice.outbox_len(FILE).await, 0);
    t.net.deliver_all().await;
    assert_eq!(assert_converged(&t).await, "hello world");

    // Live delivery resumes once the outbox is empty.
    t.alice.insert(FILE, Position::new(1, 12), "!").await.unwrap();
    t.net.deliver_all().await;
    assert_eq!(assert_converged(&t).await, "hello world!");
}

#[tokio::test]
async fn test_push_delivers_buffered_edits() {
    let t = team("x").await;
    t.net.partition(t.alice.id(), t.bob.id());
    t.alice.insert(FILE, Position::new(1, 2), "y").await.unwrap();
    t.net.heal();

    assert_eq!(t.alice.push_changes(FILE).await.unwrap(), 1);
    t.net.deliver_all().await;
    assert_eq!(assert_converged(&t).await, "xy");
}

#[tokio::test]
async fn test_sync_file_matches_live_document() {
    let t = team("abc").await;
    t.alice.insert(FILE, Position::START, "1").await.unwrap();
    t.bob.insert(FILE, Position::new(1, 4), "2").await.unwrap();
    t.net.deliver_all().await;

    let live = assert_converged(&t).await;
    assert_eq!(t.alice.sync_file(FILE).await.unwrap(), live);
    assert_eq!(t.bob.sync_file(FILE).await.unwrap(), live);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let rooms = Arc::new(RoomDirectory::new());
    let net = MemoryNetwork::new();
    let alice = collaborator(&net, &rooms, "alice");
    let bob = collaborator(&net, &rooms, "bob");
    introduce(&alice, &bob).await;

    alice.open_document(FILE, "base").await;
    let session = alice.start_session(FILE, &[]).await.unwrap();
    alice.insert(FILE, Position::new(1, 5), "line").await.unwrap();

    // Bob is not named, so he looks the session up. Alice only serves
    // pulls to participants she knows about.
    let joined = bob.join_session(session.id).await.unwrap();
    assert!(joined.is_participant(bob.id()));
    net.deliver_all().await;
    assert_eq!(bob.catch_up(FILE).await.unwrap(), 1);
    assert_eq!(bob.document_text(FILE).await.unwrap(), "baseline");
    assert!(alice
        .session(session.id)
        .await
        .unwrap()
        .is_participant(bob.id()));
}

#[tokio::test]
async fn test_presence_follows_cursor_and_leave() {
    let t = team("abc").await;

    let in_file: Vec<_> = t.alice.users_in_file(FILE).await.iter().map(|p| p.user_id).collect();
    assert!(in_file.contains(&t.bob.id()));

    t.bob.broadcast_cursor(FILE, Position::new(1, 3)).await;
    t.net.deliver_all().await;
    let seen = t.alice.presence_of(t.bob.id()).await.unwrap();
    assert_eq!(seen.cursor, Some(Position::new(1, 3)));
    assert_eq!(seen.status, PresenceStatus::Online);

    t.bob.leave_session(t.session_id).await.unwrap();
    t.net.deliver_all().await;

    let in_file: Vec<_> = t.alice.users_in_file(FILE).await.iter().map(|p| p.user_id).collect();
    assert!(!in_file.contains(&t.bob.id()));
    let session = t.alice.session(t.session_id).await.unwrap();
    assert!(!session.is_participant(t.bob.id()));
    assert!(t.bob.session(t.session_id).await.is_none());
}

#[tokio::test]
async fn test_leaving_drops_pending_conflicts() {
    let t = team("abc").await;
    conflicting_edits(&t).await;
    assert_eq!(t.alice.pending_conflicts().await.len(), 1);

    t.bob.leave_session(t.session_id).await.unwrap();
    t.net.deliver_all().await;

    assert!(t.alice.pending_conflicts().await.is_empty());
    assert!(t.bob.pending_conflicts().await.is_empty());
}

#[tokio::test]
async fn test_end_session_stops_editing() {
    let t = team("abc").await;
    t.alice.end_session(t.session_id).await.unwrap();
    t.net.deliver_all().await;

    assert!(t.bob.session_for_file(FILE).await.is_none());
    assert!(matches!(
        t.bob.insert(FILE, Position::START, "x").await,
        Err(CollabError::NoSessionForFile(_))
    ));
    assert!(matches!(
        t.bob.join_session(t.session_id).await,
        Err(CollabError::SessionInactive(_))
    ));
}
