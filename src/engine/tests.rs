use super::*;
use super::conflict::{now_ms, validate_span};
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// 2025-01-10T00:00:00Z
const DAY: Ms = 1_736_467_200_000;

// ── Conflict predicate ───────────────────────────────────

fn existing(id: Id, instructor_id: Option<Id>, student_id: Option<Id>, start: Ms, end: Ms) -> Booking {
    Booking {
        id,
        training_element_id: 1,
        instructor_id,
        student_id,
        start_time: start,
        end_time: end,
        status: BookingStatus::Pending,
        created_by_user_id: 1,
        notes: None,
        created_at: 0,
        updated_at: 0,
    }
}

fn candidate(start: Ms, end: Ms, instructor_id: Option<Id>, student_id: Option<Id>, exclude: Option<Id>) -> ConflictQuery {
    ConflictQuery {
        span: Span::new(start, end),
        instructor_id,
        student_id,
        exclude_booking_id: exclude,
    }
}

fn ids(bookings: &[Booking]) -> Vec<Id> {
    bookings.iter().map(|b| b.id).collect()
}

#[test]
fn booking_never_conflicts_with_itself_when_excluded() {
    let b = existing(3, Some(5), Some(8), DAY + 9 * H, DAY + 10 * H);
    let q = candidate(b.start_time, b.end_time, b.instructor_id, b.student_id, Some(b.id));
    assert!(find_conflicts([&b], &q, ConflictPolicy::default()).is_empty());

    // Without the exclusion it collides with itself.
    let q = ConflictQuery { exclude_booking_id: None, ..q };
    assert_eq!(ids(&find_conflicts([&b], &q, ConflictPolicy::default())), vec![3]);
}

#[test]
fn adjacent_intervals_do_not_conflict() {
    let b = existing(1, Some(5), None, DAY + 10 * H, DAY + 11 * H);
    let policy = ConflictPolicy::default();

    let after = candidate(DAY + 11 * H, DAY + 12 * H, Some(5), None, None);
    assert!(!is_conflict(&b, &after, policy));
    let before = candidate(DAY + 9 * H, DAY + 10 * H, Some(5), None, None);
    assert!(!is_conflict(&b, &before, policy));

    let straddling = candidate(DAY + 10 * H + 30 * M, DAY + 11 * H + 30 * M, Some(5), None, None);
    assert!(is_conflict(&b, &straddling, policy));
}

#[test]
fn overlap_shapes() {
    let b = existing(1, Some(5), None, DAY + 10 * H, DAY + 12 * H);
    let policy = ConflictPolicy::default();
    let hit = |start, end| is_conflict(&b, &candidate(start, end, Some(5), None, None), policy);

    assert!(hit(DAY + 10 * H, DAY + 12 * H)); // identical
    assert!(hit(DAY + 10 * H + 30 * M, DAY + 11 * H)); // inside
    assert!(hit(DAY + 9 * H, DAY + 13 * H)); // enclosing
    assert!(hit(DAY + 9 * H, DAY + 10 * H + M)); // tail overlap
    assert!(!hit(DAY + 12 * H, DAY + 12 * H + M)); // touching end
}

#[test]
fn roles_never_alias() {
    // User 5 teaches the existing booking; the candidate has student 5.
    let b = existing(1, Some(5), Some(9), DAY + 9 * H, DAY + 10 * H);
    let q = candidate(DAY + 9 * H, DAY + 10 * H, Some(6), Some(5), None);
    assert!(!is_conflict(&b, &q, ConflictPolicy::default()));

    let b = existing(2, Some(7), Some(5), DAY + 9 * H, DAY + 10 * H);
    let q = candidate(DAY + 9 * H, DAY + 10 * H, Some(5), None, None);
    assert!(!is_conflict(&b, &q, ConflictPolicy::default()));
}

#[test]
fn student_clash_is_detected() {
    let b = existing(4, Some(1), Some(9), DAY + 9 * H, DAY + 10 * H);
    let q = candidate(DAY + 9 * H + 30 * M, DAY + 10 * H + 30 * M, Some(2), Some(9), None);
    assert!(is_conflict(&b, &q, ConflictPolicy::default()));
}

#[test]
fn no_participants_means_no_conflicts() {
    let all = [
        existing(1, Some(5), None, DAY, DAY + H),
        existing(2, None, None, DAY, DAY + H),
        existing(3, None, Some(5), DAY, DAY + H),
    ];
    let q = candidate(DAY, DAY + H, None, None, None);
    assert!(find_conflicts(&all, &q, ConflictPolicy::default()).is_empty());
    // Two participant-less bookings never collide either.
    assert!(!is_conflict(&all[1], &q, ConflictPolicy::default()));
}

#[test]
fn excluded_id_is_suppressed() {
    let all = [
        existing(7, Some(5), None, DAY + 9 * H, DAY + 10 * H),
        existing(8, Some(5), None, DAY + 9 * H + 30 * M, DAY + 10 * H + 30 * M),
    ];
    let q = candidate(DAY + 9 * H, DAY + 11 * H, Some(5), None, Some(7));
    assert_eq!(ids(&find_conflicts(&all, &q, ConflictPolicy::default())), vec![8]);
}

#[test]
fn conflicts_sorted_by_start_and_deduplicated() {
    // Booking 2 matches on both instructor and student and is fed twice.
    let b1 = existing(1, Some(5), None, DAY + 10 * H, DAY + 11 * H);
    let b2 = existing(2, Some(5), Some(9), DAY + 9 * H, DAY + 10 * H + 30 * M);
    let b3 = existing(3, None, Some(9), DAY + 9 * H, DAY + 9 * H + 30 * M);
    let fed = [&b1, &b2, &b3, &b2];
    let q = candidate(DAY + 9 * H, DAY + 12 * H, Some(5), Some(9), None);
    assert_eq!(ids(&find_conflicts(fed, &q, ConflictPolicy::default())), vec![2, 3, 1]);
}

#[test]
fn scenario_single_instructor_booking() {
    let b = existing(1, Some(5), None, DAY + 9 * H, DAY + 10 * H);
    let policy = ConflictPolicy::default();

    let overlapping = candidate(DAY + 9 * H + 30 * M, DAY + 10 * H + 30 * M, Some(5), None, None);
    assert_eq!(ids(&find_conflicts([&b], &overlapping, policy)), vec![1]);

    let back_to_back = candidate(DAY + 10 * H, DAY + 11 * H, Some(5), None, None);
    assert!(find_conflicts([&b], &back_to_back, policy).is_empty());
}

#[test]
fn cancelled_bookings_block_unless_policy_frees_them() {
    let mut b = existing(1, Some(5), None, DAY + 9 * H, DAY + 10 * H);
    b.status = BookingStatus::Cancelled;
    let q = candidate(DAY + 9 * H, DAY + 10 * H, Some(5), None, None);

    assert!(is_conflict(&b, &q, ConflictPolicy::default()));
    assert!(!is_conflict(&b, &q, ConflictPolicy { ignore_cancelled: true }));
}

#[test]
fn validate_span_rules() {
    assert!(matches!(validate_span(DAY, DAY), Err(EngineError::Validation(_))));
    assert!(matches!(validate_span(DAY + H, DAY), Err(EngineError::Validation(_))));
    assert!(matches!(validate_span(-H, 0), Err(EngineError::LimitExceeded(_))));
    assert!(matches!(
        validate_span(DAY, DAY + MAX_SPAN_DURATION_MS + 1),
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(validate_span(DAY, DAY + H).unwrap(), Span::new(DAY, DAY + H));
}

// ── Async engine tests ───────────────────────────────────

/// A WAL path inside a fresh directory. Keep the `TempDir` alive for as
/// long as the path is used.
fn test_wal_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

fn actor(u: &User) -> Actor {
    Actor { id: u.id, role: u.role }
}

fn new_user(email: &str, first: &str, last: &str, role: Role) -> NewUser {
    NewUser {
        email: email.into(),
        first_name: Some(first.into()),
        last_name: Some(last.into()),
        role: Some(role),
    }
}

fn new_element(name: &str) -> NewTrainingElement {
    NewTrainingElement {
        name: Some(name.into()),
        description: Some("Landing gear, hydraulics and brakes".into()),
        duration_minutes: Some(90),
        session_type: Some(SessionType::Classroom),
        material_link: None,
    }
}

fn slot(element: Id, instructor: Option<Id>, student: Option<Id>, start: Ms, end: Ms) -> NewBooking {
    NewBooking {
        training_element_id: Some(element),
        instructor_id: instructor,
        student_id: student,
        start_time: Some(start),
        end_time: Some(end),
        ..Default::default()
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    engine: Arc<Engine>,
    admin: Actor,
    instructor: Actor,
    other_instructor: Actor,
    student: Actor,
    other_student: Actor,
    element: Id,
}

async fn fixture(name: &str) -> Fixture {
    fixture_with(name, ConflictPolicy::default()).await
}

async fn fixture_with(name: &str, policy: ConflictPolicy) -> Fixture {
    let (dir, path) = test_wal_path(name);
    let engine = Arc::new(Engine::new(path, policy).unwrap());
    let admin = actor(&engine.ensure_admin("admin@example.com").await.unwrap());
    let register = async |email: &str, first: &str, last: &str, role: Role| {
        actor(&engine.register_user(None, new_user(email, first, last, role)).await.unwrap())
    };
    let instructor = register("jane@example.com", "Jane", "Doe", Role::Instructor).await;
    let other_instructor = register("mark@example.com", "Mark", "Twain", Role::Instructor).await;
    let student = register("alice@example.com", "Alice", "Smith", Role::Student).await;
    let other_student = register("bob@example.com", "Bob", "Brown", Role::Student).await;
    let element = engine
        .create_training_element(Some(&admin), new_element("A320 Systems"))
        .await
        .unwrap()
        .id;
    Fixture { _dir: dir, engine, admin, instructor, other_instructor, student, other_student, element }
}

#[tokio::test]
async fn engine_scenario_reject_overlap_accept_adjacent() {
    let f = fixture("scenario.wal").await;
    let first = f
        .engine
        .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();

    let overlapping = slot(f.element, Some(f.instructor.id), None, DAY + 9 * H + 30 * M, DAY + 10 * H + 30 * M);
    match f.engine.create_booking(Some(&f.instructor), overlapping).await {
        Err(EngineError::Conflict(conflicts)) => assert_eq!(ids(&conflicts), vec![first.id]),
        other => panic!("expected conflict, got {other:?}"),
    }

    let adjacent = slot(f.element, Some(f.instructor.id), None, DAY + 10 * H, DAY + 11 * H);
    let second = f.engine.create_booking(Some(&f.instructor), adjacent).await.unwrap();
    assert_eq!(f.engine.store().booking_count(), 2);
    // The rejected create did not use up an id.
    assert_eq!(second.id, first.id + 1);
}

#[tokio::test]
async fn engine_find_conflicts_reads_participant_indexes() {
    let f = fixture("find_conflicts.wal").await;
    let b = f
        .engine
        .create_booking(
            Some(&f.instructor),
            slot(f.element, Some(f.instructor.id), Some(f.student.id), DAY + 9 * H, DAY + 10 * H),
        )
        .await
        .unwrap();

    let by_student = candidate(DAY + 9 * H, DAY + 10 * H, Some(f.other_instructor.id), Some(f.student.id), None);
    assert_eq!(ids(&f.engine.find_conflicts(&by_student)), vec![b.id]);

    let other_people = candidate(DAY + 9 * H, DAY + 10 * H, Some(f.other_instructor.id), Some(f.other_student.id), None);
    assert!(f.engine.find_conflicts(&other_people).is_empty());

    let nobody = candidate(DAY + 9 * H, DAY + 10 * H, None, None, None);
    assert!(f.engine.find_conflicts(&nobody).is_empty());

    let itself = candidate(DAY + 9 * H, DAY + 10 * H, Some(f.instructor.id), Some(f.student.id), Some(b.id));
    assert!(f.engine.find_conflicts(&itself).is_empty());
}

#[tokio::test]
async fn engine_student_double_booking_rejected() {
    let f = fixture("student_double.wal").await;
    f.engine
        .create_booking(
            Some(&f.instructor),
            slot(f.element, Some(f.instructor.id), Some(f.student.id), DAY + 9 * H, DAY + 10 * H),
        )
        .await
        .unwrap();

    let result = f
        .engine
        .create_booking(
            Some(&f.other_instructor),
            slot(f.element, Some(f.other_instructor.id), Some(f.student.id), DAY + 9 * H, DAY + 10 * H),
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));

    // A different student with a different instructor is fine.
    f.engine
        .create_booking(
            Some(&f.other_instructor),
            slot(f.element, Some(f.other_instructor.id), Some(f.other_student.id), DAY + 9 * H, DAY + 10 * H),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_bookings_without_participants_never_conflict() {
    let f = fixture("no_participants.wal").await;
    for _ in 0..3 {
        f.engine
            .create_booking(Some(&f.instructor), slot(f.element, None, None, DAY + 9 * H, DAY + 10 * H))
            .await
            .unwrap();
    }
    let txn = f.engine.begin_booking_txn(std::iter::empty()).await;
    assert_eq!(txn.locked_participants(), 0);
}

#[tokio::test]
async fn engine_booking_txn_locks_each_participant_once() {
    let f = fixture("txn_locks.wal").await;
    let txn = f.engine.begin_booking_txn([9, 3, 9, 1]).await;
    assert_eq!(txn.locked_participants(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_concurrent_overlapping_creates_admit_one() {
    let f = fixture("concurrent_creates.wal").await;
    let mut handles = Vec::new();
    for k in 0..16i64 {
        let engine = f.engine.clone();
        let instructor = f.instructor;
        let element = f.element;
        handles.push(tokio::spawn(async move {
            let input = slot(element, Some(instructor.id), None, DAY + 9 * H + k * M, DAY + 10 * H + k * M);
            engine.create_booking(Some(&instructor), input).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for result in futures::future::join_all(handles).await {
        match result.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(f.engine.store().booking_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_concurrent_updates_cannot_double_book() {
    let f = fixture("concurrent_updates.wal").await;
    let mut booking_ids = Vec::new();
    for k in 0..8i64 {
        let b = f
            .engine
            .create_booking(
                Some(&f.instructor),
                slot(f.element, Some(f.instructor.id), None, DAY + k * 2 * H, DAY + k * 2 * H + H),
            )
            .await
            .unwrap();
        booking_ids.push(b.id);
    }

    // Every booking tries to move into the same slot at once.
    let mut handles = Vec::new();
    for id in booking_ids {
        let engine = f.engine.clone();
        let instructor = f.instructor;
        handles.push(tokio::spawn(async move {
            let patch = BookingPatch {
                start_time: Some(DAY + 20 * H),
                end_time: Some(DAY + 21 * H),
                ..Default::default()
            };
            engine.update_booking(Some(&instructor), id, patch).await
        }));
    }
    let moved = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(moved, 1);
}

#[tokio::test]
async fn engine_create_booking_requires_instructor() {
    let f = fixture("create_roles.wal").await;
    let input = slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H);

    let anonymous = f.engine.create_booking(None, input.clone()).await;
    assert!(matches!(anonymous, Err(EngineError::Unauthenticated)));
    let student = f.engine.create_booking(Some(&f.student), input.clone()).await;
    assert!(matches!(student, Err(EngineError::Forbidden(_))));
    let admin = f.engine.create_booking(Some(&f.admin), input.clone()).await;
    assert!(matches!(admin, Err(EngineError::Forbidden(_))));

    let b = f.engine.create_booking(Some(&f.instructor), input).await.unwrap();
    assert_eq!(b.created_by_user_id, f.instructor.id);
    assert_eq!(b.status, BookingStatus::Pending);
}

#[tokio::test]
async fn engine_create_booking_validation() {
    let f = fixture("create_validation.wal").await;
    let who = Some(&f.instructor);

    let missing = NewBooking { instructor_id: Some(f.instructor.id), ..Default::default() };
    match f.engine.create_booking(who, missing).await {
        Err(EngineError::Validation(msg)) => {
            assert!(msg.contains("training_element_id"));
            assert!(msg.contains("start_time"));
            assert!(msg.contains("end_time"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    let backwards = slot(f.element, Some(f.instructor.id), None, DAY + 10 * H, DAY + 9 * H);
    assert!(matches!(f.engine.create_booking(who, backwards).await, Err(EngineError::Validation(_))));

    let empty = slot(f.element, Some(f.instructor.id), None, DAY + 10 * H, DAY + 10 * H);
    assert!(matches!(f.engine.create_booking(who, empty).await, Err(EngineError::Validation(_))));

    let unknown_element = slot(999, Some(f.instructor.id), None, DAY, DAY + H);
    assert!(matches!(f.engine.create_booking(who, unknown_element).await, Err(EngineError::Validation(_))));

    let unknown_student = slot(f.element, Some(f.instructor.id), Some(999), DAY, DAY + H);
    match f.engine.create_booking(who, unknown_student).await {
        Err(EngineError::Validation(msg)) => assert!(msg.contains("student with id 999")),
        other => panic!("expected validation error, got {other:?}"),
    }

    let mut long_notes = slot(f.element, Some(f.instructor.id), None, DAY, DAY + H);
    long_notes.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
    assert!(matches!(f.engine.create_booking(who, long_notes).await, Err(EngineError::LimitExceeded(_))));

    assert_eq!(f.engine.store().booking_count(), 0);
}

#[tokio::test]
async fn engine_update_excludes_own_booking() {
    let f = fixture("update_self.wal").await;
    let b = f
        .engine
        .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();

    let patch = BookingPatch {
        start_time: Some(DAY + 9 * H + 30 * M),
        end_time: Some(DAY + 10 * H + 30 * M),
        ..Default::default()
    };
    let updated = f.engine.update_booking(Some(&f.instructor), b.id, patch).await.unwrap();
    assert_eq!(updated.start_time, DAY + 9 * H + 30 * M);
    assert!(updated.updated_at >= b.updated_at);
}

#[tokio::test]
async fn engine_update_rechecks_when_participants_change() {
    let f = fixture("update_participants.wal").await;
    let mine = f
        .engine
        .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    let theirs = f
        .engine
        .create_booking(
            Some(&f.other_instructor),
            slot(f.element, Some(f.other_instructor.id), None, DAY + 9 * H, DAY + 10 * H),
        )
        .await
        .unwrap();

    let notes_only = BookingPatch { notes: Some(Some("room 4".into())), ..Default::default() };
    let updated = f.engine.update_booking(Some(&f.instructor), theirs.id, notes_only).await.unwrap();
    assert_eq!(updated.notes.as_deref(), Some("room 4"));

    let swap = BookingPatch { instructor_id: Some(Some(f.instructor.id)), ..Default::default() };
    match f.engine.update_booking(Some(&f.instructor), theirs.id, swap).await {
        Err(EngineError::Conflict(c)) => assert_eq!(ids(&c), vec![mine.id]),
        other => panic!("expected conflict, got {other:?}"),
    }

    let swap_and_move = BookingPatch {
        instructor_id: Some(Some(f.instructor.id)),
        start_time: Some(DAY + 10 * H),
        end_time: Some(DAY + 11 * H),
        ..Default::default()
    };
    let moved = f.engine.update_booking(Some(&f.instructor), theirs.id, swap_and_move).await.unwrap();
    assert_eq!(moved.instructor_id, Some(f.instructor.id));
}

#[tokio::test]
async fn engine_status_only_update_skips_check() {
    let f = fixture("update_no_recheck.wal").await;
    let b = f
        .engine
        .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();

    let confirm = BookingPatch { status: Some(BookingStatus::Confirmed), ..Default::default() };
    let confirmed = f.engine.update_booking(Some(&f.instructor), b.id, confirm).await.unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);

    let cancel = BookingPatch { status: Some(BookingStatus::Cancelled), ..Default::default() };
    let cancelled = f.engine.update_booking(Some(&f.instructor), b.id, cancel).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn engine_reviving_freed_slot_is_rechecked() {
    let f = fixture_with("update_revive.wal", ConflictPolicy { ignore_cancelled: true }).await;
    let cancelled = f
        .engine
        .create_booking(
            Some(&f.instructor),
            NewBooking {
                status: Some(BookingStatus::Cancelled),
                ..slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H)
            },
        )
        .await
        .unwrap();
    // The cancelled booking frees its slot under this policy.
    let live = f
        .engine
        .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();

    let revive = BookingPatch { status: Some(BookingStatus::Confirmed), ..Default::default() };
    match f.engine.update_booking(Some(&f.instructor), cancelled.id, revive).await {
        Err(EngineError::Conflict(c)) => assert_eq!(ids(&c), vec![live.id]),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(f.engine.store().get_booking(cancelled.id).unwrap().status, BookingStatus::Cancelled);

    // Once the other booking is gone the slot can be taken back.
    f.engine.delete_booking(Some(&f.instructor), live.id).await.unwrap();
    let revive = BookingPatch { status: Some(BookingStatus::Pending), ..Default::default() };
    let revived = f.engine.update_booking(Some(&f.instructor), cancelled.id, revive).await.unwrap();
    assert_eq!(revived.status, BookingStatus::Pending);
}

#[tokio::test]
async fn engine_update_can_clear_participants() {
    let f = fixture("update_clear.wal").await;
    let b = f
        .engine
        .create_booking(
            Some(&f.instructor),
            slot(f.element, Some(f.instructor.id), Some(f.student.id), DAY + 9 * H, DAY + 10 * H),
        )
        .await
        .unwrap();

    let clear = BookingPatch { student_id: Some(None), ..Default::default() };
    let updated = f.engine.update_booking(Some(&f.instructor), b.id, clear).await.unwrap();
    assert_eq!(updated.student_id, None);

    // The student is free again.
    let q = candidate(DAY + 9 * H, DAY + 10 * H, None, Some(f.student.id), None);
    assert!(f.engine.find_conflicts(&q).is_empty());
}

#[tokio::test]
async fn engine_update_validation() {
    let f = fixture("update_validation.wal").await;
    let b = f
        .engine
        .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    let who = Some(&f.instructor);

    let empty = f.engine.update_booking(who, b.id, BookingPatch::default()).await;
    assert!(matches!(empty, Err(EngineError::Validation(_))));

    let inverted = BookingPatch { end_time: Some(DAY + 8 * H), ..Default::default() };
    assert!(matches!(f.engine.update_booking(who, b.id, inverted).await, Err(EngineError::Validation(_))));

    let missing = BookingPatch { status: Some(BookingStatus::Completed), ..Default::default() };
    assert!(matches!(
        f.engine.update_booking(who, 999, missing.clone()).await,
        Err(EngineError::NotFound { kind: "booking", id: 999 })
    ));
    assert!(matches!(
        f.engine.update_booking(Some(&f.admin), b.id, missing).await,
        Err(EngineError::Forbidden(_))
    ));

    let bad_element = BookingPatch { training_element_id: Some(999), ..Default::default() };
    assert!(matches!(f.engine.update_booking(who, b.id, bad_element).await, Err(EngineError::Validation(_))));

    // Rejected updates leave the row untouched.
    let stored = f.engine.store().get_booking(b.id).unwrap();
    assert_eq!(stored, b);
}

#[tokio::test]
async fn engine_delete_booking_permissions() {
    let f = fixture("delete_permissions.wal").await;
    let make = async |start: Ms| {
        f.engine
            .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, start, start + H))
            .await
            .unwrap()
            .id
    };
    let first = make(DAY).await;
    let second = make(DAY + 2 * H).await;

    let by_other = f.engine.delete_booking(Some(&f.other_instructor), first).await;
    assert!(matches!(by_other, Err(EngineError::Forbidden(_))));
    let by_student = f.engine.delete_booking(Some(&f.student), first).await;
    assert!(matches!(by_student, Err(EngineError::Forbidden(_))));
    let anonymous = f.engine.delete_booking(None, first).await;
    assert!(matches!(anonymous, Err(EngineError::Unauthenticated)));

    f.engine.delete_booking(Some(&f.instructor), first).await.unwrap();
    f.engine.delete_booking(Some(&f.admin), second).await.unwrap();
    assert_eq!(f.engine.store().booking_count(), 0);

    let again = f.engine.delete_booking(Some(&f.admin), second).await;
    assert!(matches!(again, Err(EngineError::NotFound { .. })));

    // The freed slot can be booked again.
    make(DAY).await;
}

#[tokio::test]
async fn engine_list_bookings_filters() {
    let f = fixture("list_filters.wal").await;
    let safety = f
        .engine
        .create_training_element(Some(&f.instructor), new_element("Cabin Safety"))
        .await
        .unwrap()
        .id;
    let a = f
        .engine
        .create_booking(
            Some(&f.instructor),
            slot(f.element, Some(f.instructor.id), Some(f.student.id), DAY + 13 * H, DAY + 14 * H),
        )
        .await
        .unwrap();
    let b = f
        .engine
        .create_booking(
            Some(&f.other_instructor),
            NewBooking {
                status: Some(BookingStatus::Confirmed),
                ..slot(safety, Some(f.other_instructor.id), Some(f.other_student.id), DAY + 9 * H, DAY + 10 * H)
            },
        )
        .await
        .unwrap();
    let list = |filter: BookingFilter| ids(&f.engine.list_bookings(Some(&f.student), &filter).unwrap().into_iter().map(|d| d.booking).collect::<Vec<_>>());

    assert_eq!(list(BookingFilter::default()), vec![b.id, a.id]);
    assert_eq!(list(BookingFilter { training_element_name: Some("safety".into()), ..Default::default() }), vec![b.id]);
    assert_eq!(list(BookingFilter { instructor_name: Some("DOE".into()), ..Default::default() }), vec![a.id]);
    assert_eq!(list(BookingFilter { student_name: Some("bob".into()), ..Default::default() }), vec![b.id]);
    assert_eq!(list(BookingFilter { created_by_name: Some("twain".into()), ..Default::default() }), vec![b.id]);
    assert_eq!(list(BookingFilter { status: Some(BookingStatus::Pending), ..Default::default() }), vec![a.id]);
    assert_eq!(list(BookingFilter { start_from: Some(DAY + 12 * H), ..Default::default() }), vec![a.id]);
    assert_eq!(list(BookingFilter { end_until: Some(DAY + 12 * H), ..Default::default() }), vec![b.id]);
    assert_eq!(list(BookingFilter { instructor_id: Some(f.instructor.id), ..Default::default() }), vec![a.id]);
    assert_eq!(list(BookingFilter { student_id: Some(f.other_student.id), ..Default::default() }), vec![b.id]);
    assert_eq!(list(BookingFilter { created_by_user_id: Some(f.instructor.id), ..Default::default() }), vec![a.id]);
    assert_eq!(list(BookingFilter { id: Some(a.id), status: Some(BookingStatus::Cancelled), ..Default::default() }), Vec::<Id>::new());

    let details = f.engine.get_booking(Some(&f.student), a.id).unwrap();
    assert_eq!(details.training_element_name.as_deref(), Some("A320 Systems"));
    assert_eq!(details.instructor_name.as_deref(), Some("Jane Doe"));
    assert_eq!(details.student_name.as_deref(), Some("Alice Smith"));
    assert_eq!(details.created_by_email.as_deref(), Some("jane@example.com"));

    assert!(matches!(f.engine.list_bookings(None, &BookingFilter::default()), Err(EngineError::Unauthenticated)));
}

#[tokio::test]
async fn engine_register_users() {
    let f = fixture("register.wal").await;

    let dup = f.engine.register_user(None, new_user("JANE@example.com", "J", "D", Role::Student)).await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(_))));

    let bad = f.engine.register_user(None, new_user("not-an-email", "N", "E", Role::Student)).await;
    assert!(matches!(bad, Err(EngineError::Validation(_))));

    let sneaky = f.engine.register_user(Some(&f.instructor), new_user("root@example.com", "R", "T", Role::Admin)).await;
    assert!(matches!(sneaky, Err(EngineError::Forbidden(_))));
    let anonymous = f.engine.register_user(None, new_user("root@example.com", "R", "T", Role::Admin)).await;
    assert!(matches!(anonymous, Err(EngineError::Unauthenticated)));

    let second_admin = f
        .engine
        .register_user(Some(&f.admin), new_user("root@example.com", "R", "T", Role::Admin))
        .await
        .unwrap();
    assert_eq!(second_admin.role, Role::Admin);

    let defaulted = f
        .engine
        .register_user(None, NewUser { email: "carol@example.com".into(), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(defaulted.role, Role::Student);
    assert_eq!(f.engine.resolve_actor("Carol@Example.com"), Some(actor(&defaulted)));
    assert_eq!(f.engine.resolve_actor("nobody@example.com"), None);

    let users = f.engine.list_users(Some(&f.admin)).unwrap();
    assert_eq!(users.len(), 7);
    assert!(users.windows(2).all(|w| w[0].id < w[1].id));
    assert!(matches!(f.engine.list_users(Some(&f.instructor)), Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn engine_ensure_admin_is_idempotent() {
    let f = fixture("ensure_admin.wal").await;
    let again = f.engine.ensure_admin("ADMIN@example.com").await.unwrap();
    assert_eq!(again.id, f.admin.id);
    assert_eq!(f.engine.store().user_count(), 5);
}

#[tokio::test]
async fn engine_training_element_lifecycle() {
    let f = fixture("element_lifecycle.wal").await;
    let who = Some(&f.instructor);

    assert!(matches!(
        f.engine.create_training_element(Some(&f.student), new_element("X")).await,
        Err(EngineError::Forbidden(_))
    ));
    let missing = NewTrainingElement { name: Some("Only a name".into()), ..Default::default() };
    match f.engine.create_training_element(who, missing).await {
        Err(EngineError::Validation(msg)) => {
            assert_eq!(msg, "missing required fields: description, duration_minutes, session_type")
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    let zero = NewTrainingElement { duration_minutes: Some(0), ..new_element("Zero") };
    assert!(matches!(f.engine.create_training_element(who, zero).await, Err(EngineError::Validation(_))));

    let e = f.engine.create_training_element(who, new_element("CRM")).await.unwrap();
    assert_eq!(f.engine.get_training_element(Some(&f.admin), e.id).unwrap(), e);
    assert!(matches!(f.engine.get_training_element(Some(&f.student), e.id), Err(EngineError::Forbidden(_))));
    assert!(matches!(
        f.engine.get_training_element(who, 999),
        Err(EngineError::NotFound { kind: "training element", id: 999 })
    ));

    let patch = TrainingElementPatch {
        session_type: Some(SessionType::HandsOn),
        material_link: Some(Some("https://example.com/crm.pdf".into())),
        ..Default::default()
    };
    assert!(matches!(
        f.engine.update_training_element(Some(&f.admin), e.id, patch.clone()).await,
        Err(EngineError::Forbidden(_))
    ));
    let updated = f.engine.update_training_element(who, e.id, patch).await.unwrap();
    assert_eq!(updated.session_type, SessionType::HandsOn);
    assert_eq!(updated.name, "CRM");

    let clear_link = TrainingElementPatch { material_link: Some(None), ..Default::default() };
    assert_eq!(f.engine.update_training_element(who, e.id, clear_link).await.unwrap().material_link, None);

    let names: Vec<String> = f.engine.list_training_elements().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["A320 Systems", "CRM"]);

    f.engine.delete_training_element(who, e.id).await.unwrap();
    assert_eq!(f.engine.list_training_elements().len(), 1);
    assert_eq!(f.engine.session_types().len(), 4);
}

#[tokio::test]
async fn engine_element_in_use_cannot_be_deleted() {
    let f = fixture("element_in_use.wal").await;
    let b = f
        .engine
        .create_booking(Some(&f.instructor), slot(f.element, Some(f.instructor.id), None, DAY, DAY + H))
        .await
        .unwrap();

    let result = f.engine.delete_training_element(Some(&f.instructor), f.element).await;
    assert!(matches!(result, Err(EngineError::InUse { kind: "training element", .. })));

    f.engine.delete_booking(Some(&f.instructor), b.id).await.unwrap();
    f.engine.delete_training_element(Some(&f.instructor), f.element).await.unwrap();
}

#[tokio::test]
async fn engine_wal_replay() {
    let (_dir, path) = test_wal_path("replay.wal");
    let (booking, element_count) = {
        let engine = Engine::new(path.clone(), ConflictPolicy::default()).unwrap();
        let admin = actor(&engine.ensure_admin("admin@example.com").await.unwrap());
        let instructor = actor(
            &engine
                .register_user(None, new_user("jane@example.com", "Jane", "Doe", Role::Instructor))
                .await
                .unwrap(),
        );
        let element = engine.create_training_element(Some(&admin), new_element("A320 Systems")).await.unwrap();
        let b = engine
            .create_booking(Some(&instructor), slot(element.id, Some(instructor.id), None, DAY, DAY + H))
            .await
            .unwrap();
        let patch = BookingPatch { notes: Some(Some("after replay".into())), ..Default::default() };
        let b = engine.update_booking(Some(&instructor), b.id, patch).await.unwrap();
        (b, engine.store().element_count())
    };

    let engine = Engine::new(path, ConflictPolicy::default()).unwrap();
    assert_eq!(engine.store().user_count(), 2);
    assert_eq!(engine.store().element_count(), element_count);
    assert_eq!(engine.store().get_booking(booking.id).unwrap(), booking);

    // The conflict index survived too.
    let q = candidate(DAY, DAY + H, booking.instructor_id, None, None);
    assert_eq!(ids(&engine.find_conflicts(&q)), vec![booking.id]);

    // Sequences continue after the replayed ids.
    let next = engine
        .register_user(None, new_user("late@example.com", "L", "A", Role::Student))
        .await
        .unwrap();
    assert_eq!(next.id, 3);
}

#[tokio::test]
async fn engine_compaction_preserves_state_and_sequences() {
    let (_dir, path) = test_wal_path("compact_engine.wal");
    let last_deleted = {
        let f_engine = Engine::new(path.clone(), ConflictPolicy::default()).unwrap();
        let admin = actor(&f_engine.ensure_admin("admin@example.com").await.unwrap());
        let instructor = actor(
            &f_engine
                .register_user(None, new_user("jane@example.com", "Jane", "Doe", Role::Instructor))
                .await
                .unwrap(),
        );
        let element = f_engine.create_training_element(Some(&admin), new_element("A320 Systems")).await.unwrap();
        let mut last = 0;
        for k in 0..10 {
            let b = f_engine
                .create_booking(
                    Some(&instructor),
                    slot(element.id, Some(instructor.id), None, DAY + k * H, DAY + k * H + H),
                )
                .await
                .unwrap();
            if k % 2 == 1 {
                f_engine.delete_booking(Some(&admin), b.id).await.unwrap();
                last = b.id;
            }
        }
        assert!(f_engine.wal_appends_since_compact().await >= 18);
        let before = std::fs::metadata(&path).unwrap().len();
        f_engine.compact_wal().await.unwrap();
        assert_eq!(f_engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        last
    };

    let engine = Engine::new(path, ConflictPolicy::default()).unwrap();
    assert_eq!(engine.store().booking_count(), 5);
    assert_eq!(engine.store().user_count(), 2);
    let instructor = engine.resolve_actor("jane@example.com").unwrap();
    let b = engine
        .create_booking(Some(&instructor), slot(1, Some(instructor.id), None, DAY + 20 * H, DAY + 21 * H))
        .await
        .unwrap();
    assert!(b.id > last_deleted, "deleted booking ids are never reused");
}

#[tokio::test]
async fn engine_writes_after_compaction_are_durable() {
    let (_dir, path) = test_wal_path("compact_then_write.wal");
    {
        let engine = Engine::new(path.clone(), ConflictPolicy::default()).unwrap();
        engine.ensure_admin("admin@example.com").await.unwrap();
        engine.compact_wal().await.unwrap();
        engine
            .register_user(None, new_user("jane@example.com", "Jane", "Doe", Role::Instructor))
            .await
            .unwrap();
    }
    let engine = Engine::new(path, ConflictPolicy::default()).unwrap();
    assert_eq!(engine.store().user_count(), 2);
    assert!(engine.resolve_actor("jane@example.com").is_some());
}

#[tokio::test]
async fn engine_writes_after_torn_tail_survive_restart() {
    let (_dir, path) = test_wal_path("torn_restart.wal");
    {
        let engine = Engine::new(path.clone(), ConflictPolicy::default()).unwrap();
        engine.ensure_admin("admin@example.com").await.unwrap();
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
    }
    {
        let engine = Engine::new(path.clone(), ConflictPolicy::default()).unwrap();
        assert_eq!(engine.store().user_count(), 1);
        engine
            .register_user(None, new_user("late@example.com", "L", "A", Role::Student))
            .await
            .unwrap();
        assert_eq!(engine.store().user_count(), 2);
    }
    let engine = Engine::new(path, ConflictPolicy::default()).unwrap();
    assert_eq!(engine.store().user_count(), 2);
    assert!(engine.resolve_actor("late@example.com").is_some());
}

#[test]
fn now_ms_is_after_2025() {
    assert!(now_ms() > DAY);
}
