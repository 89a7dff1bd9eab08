mod attendance;
mod availability;
mod booking;
mod error;
mod ledger;
mod lifecycle;
mod queries;

pub use availability::{intersect_span_sets, merge_spans, total_secs, window_bookable};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::room::RoomProvider;
use crate::wal::Wal;

pub type SharedSlot = Arc<RwLock<SlotState>>;
pub type SharedStudent = Arc<RwLock<StudentState>>;
pub type SharedLesson = Arc<RwLock<LessonState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block on the first append, drain whatever else is immediately queued,
/// fsync once for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }
                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch (these callers are all told this one failed).
    let flush_err = wal.flush_sync().err();
    let result: io::Result<()> = match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Shared apply helpers ─────────────────────────────────
//
// Both the live mutation paths (holding row locks) and WAL replay (sole
// owner, no contention) funnel through these, so the two can't drift.

pub(super) fn apply_reserve(slot: &mut SlotState) {
    slot.hours_booked += 1;
}

pub(super) fn apply_release(slot: &mut SlotState) {
    slot.hours_booked = slot.hours_booked.saturating_sub(1);
}

pub(super) fn apply_debit(pkg: &mut PackageAssignment, hours: f64) {
    pkg.hours_remaining = (pkg.hours_remaining - hours).max(0.0);
}

/// Credit capped at the original allotment; a double refund can never push
/// the balance above what was purchased.
pub(super) fn apply_credit(pkg: &mut PackageAssignment, hours: f64) {
    pkg.hours_remaining = (pkg.hours_remaining + hours).min(pkg.total_hours);
}

pub(super) fn apply_cancelled(
    lesson: &mut Lesson,
    actor: Actor,
    reason: &str,
    at: DateTime<Utc>,
    refund_hours: f64,
) {
    lesson.status = LessonStatus::Cancelled;
    lesson.cancelled_at = Some(at);
    lesson.cancelled_by = Some(actor);
    lesson.cancel_reason = Some(reason.to_string());
    lesson.refunded_hours = refund_hours;
}

pub(super) fn apply_closed_session(state: &mut LessonState, participant_id: Ulid, at: DateTime<Utc>) {
    if let Some(idx) = state.open_session_idx(participant_id) {
        let session = &mut state.sessions[idx];
        session.left_at = Some(at);
        session.duration_secs = Some((at - session.joined_at).num_seconds().max(0));
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub policy: BookingPolicy,
    /// One row per (tutor, date, hour); the uniqueness constraint lives in
    /// this key. Rows are individually locked; the map itself is lock-free.
    pub(super) slots: DashMap<SlotKey, SharedSlot>,
    /// Tutor → declared window keys, for range queries without a full scan.
    pub(super) tutor_windows: DashMap<Ulid, Vec<SlotKey>>,
    pub(super) students: DashMap<Ulid, SharedStudent>,
    pub(super) lessons: DashMap<Ulid, SharedLesson>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) rooms: Arc<dyn RoomProvider>,
    /// Mutators hold this shared for the span of their transaction (WAL
    /// append through in-memory apply); compaction takes it exclusive, so
    /// its scan never observes a mutation whose event is durable but whose
    /// state is not yet applied. Taken before any row lock.
    compact_lock: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        policy: BookingPolicy,
        notify: Arc<NotifyHub>,
        rooms: Arc<dyn RoomProvider>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            policy,
            slots: DashMap::new(),
            tutor_windows: DashMap::new(),
            students: DashMap::new(),
            lessons: DashMap::new(),
            wal_tx,
            notify,
            rooms,
            compact_lock: RwLock::new(()),
        };
        for event in &events {
            engine.replay_apply(event);
        }
        tracing::info!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(engine)
    }

    /// Write an event through the background group-commit writer. The call
    /// returns only after the event is durable (or the write failed).
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Shared gate every mutation holds while it appends and applies.
    /// Always acquired before row locks, and row locks are released first,
    /// so the gate introduces no lock-order cycle.
    pub(super) async fn mutation_gate(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.compact_lock.read().await
    }

    /// Acquire a row write lock within the policy's bound. Expiry surfaces
    /// as a retryable `LockTimeout` rather than queueing indefinitely.
    pub(super) async fn lock_write<T: Send + Sync + 'static>(
        &self,
        row: &Arc<RwLock<T>>,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<T>, EngineError> {
        tokio::time::timeout(self.policy.lock_timeout, row.clone().write_owned())
            .await
            .map_err(|_| EngineError::LockTimeout)
    }

    pub(super) fn slot(&self, key: &SlotKey) -> Option<SharedSlot> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    pub(super) fn student(&self, id: &Ulid) -> Option<SharedStudent> {
        self.students.get(id).map(|e| e.value().clone())
    }

    pub(super) fn lesson_state(&self, id: &Ulid) -> Option<SharedLesson> {
        self.lessons.get(id).map(|e| e.value().clone())
    }

    /// Fire-and-forget dispatch to both parties of a lesson.
    pub(super) fn notify_parties(&self, lesson: &Lesson, event: &Event) {
        self.notify.send(lesson.tutor_id, event);
        self.notify.send(lesson.student_id, event);
    }

    // ── Replay ───────────────────────────────────────────

    /// Apply one event during startup replay. We are the sole owner of every
    /// Arc at this point, so try_write always succeeds instantly. Events are
    /// facts: no policy checks are re-run here.
    fn replay_apply(&self, event: &Event) {
        match event {
            Event::WindowDeclared {
                tutor_id,
                date,
                hour,
            } => {
                let key = SlotKey {
                    tutor_id: *tutor_id,
                    date: *date,
                    hour: *hour,
                };
                match self.slots.get(&key) {
                    Some(entry) => {
                        let slot = entry.value().clone();
                        slot.try_write().expect("replay: uncontended write").is_available = true;
                    }
                    None => {
                        self.slots
                            .insert(key, Arc::new(RwLock::new(SlotState::new(key))));
                        self.tutor_windows.entry(*tutor_id).or_default().push(key);
                    }
                }
            }
            Event::WindowWithdrawn {
                tutor_id,
                date,
                hour,
            } => {
                let key = SlotKey {
                    tutor_id: *tutor_id,
                    date: *date,
                    hour: *hour,
                };
                if let Some(entry) = self.slots.get(&key) {
                    let slot = entry.value().clone();
                    slot.try_write().expect("replay: uncontended write").is_available = false;
                }
            }
            Event::PackageAssigned {
                id,
                student_id,
                package_id,
                hours,
                assigned_at,
                expires_at,
            } => {
                let row = self
                    .students
                    .entry(*student_id)
                    .or_insert_with(|| Arc::new(RwLock::new(StudentState::new(*student_id))))
                    .value()
                    .clone();
                row.try_write()
                    .expect("replay: uncontended write")
                    .packages
                    .push(PackageAssignment {
                        id: *id,
                        student_id: *student_id,
                        package_id: *package_id,
                        total_hours: *hours,
                        hours_remaining: *hours,
                        assigned_at: *assigned_at,
                        expires_at: *expires_at,
                    });
            }
            Event::LessonBooked {
                id,
                tutor_id,
                student_id,
                date,
                start_hour,
                end_hour,
                language,
                topic,
                package_assignment_id,
                hours,
                room,
                booked_at,
            } => {
                let lesson = Lesson {
                    id: *id,
                    tutor_id: *tutor_id,
                    student_id: *student_id,
                    date: *date,
                    start_hour: *start_hour,
                    end_hour: *end_hour,
                    status: LessonStatus::Scheduled,
                    language: language.clone(),
                    topic: topic.clone(),
                    package_assignment_id: *package_assignment_id,
                    hours: *hours,
                    room: room.clone(),
                    booked_at: *booked_at,
                    started_at: None,
                    completed_at: None,
                    cancelled_at: None,
                    cancelled_by: None,
                    cancel_reason: None,
                    refunded_hours: 0.0,
                    no_show_at: None,
                    rating: None,
                    feedback: None,
                };
                for key in lesson.slot_keys() {
                    if let Some(entry) = self.slots.get(&key) {
                        let slot = entry.value().clone();
                        apply_reserve(&mut slot.try_write().expect("replay: uncontended write"));
                    }
                }
                if let Some(row) = self.student(student_id) {
                    let mut guard = row.try_write().expect("replay: uncontended write");
                    guard.booked.push((*id, lesson.span()));
                    if let Some(pkg) = guard.package_mut(*package_assignment_id) {
                        apply_debit(pkg, *hours);
                    }
                }
                self.lessons
                    .insert(*id, Arc::new(RwLock::new(LessonState::new(lesson))));
            }
            Event::LessonCancelled {
                id,
                actor,
                reason,
                at,
                refund_hours,
            } => {
                if let Some(row) = self.lesson_state(id) {
                    let mut guard = row.try_write().expect("replay: uncontended write");
                    apply_cancelled(&mut guard.lesson, *actor, reason, *at, *refund_hours);
                    let lesson = guard.lesson.clone();
                    drop(guard);
                    self.replay_release_lesson(&lesson, *refund_hours);
                }
            }
            Event::LessonStarted { id, at } => {
                if let Some(row) = self.lesson_state(id) {
                    let mut guard = row.try_write().expect("replay: uncontended write");
                    guard.lesson.status = LessonStatus::InProgress;
                    guard.lesson.started_at = Some(*at);
                }
            }
            Event::LessonCompleted { id, at } => {
                if let Some(row) = self.lesson_state(id) {
                    let mut guard = row.try_write().expect("replay: uncontended write");
                    guard.lesson.status = LessonStatus::Completed;
                    guard.lesson.completed_at = Some(*at);
                    let (student_id, lesson_id) = (guard.lesson.student_id, guard.lesson.id);
                    drop(guard);
                    if let Some(srow) = self.student(&student_id) {
                        srow.try_write()
                            .expect("replay: uncontended write")
                            .remove_booked(lesson_id);
                    }
                }
            }
            Event::LessonNoShow { id, at } => {
                if let Some(row) = self.lesson_state(id) {
                    let mut guard = row.try_write().expect("replay: uncontended write");
                    guard.lesson.status = LessonStatus::NoShow;
                    guard.lesson.no_show_at = Some(*at);
                    let lesson = guard.lesson.clone();
                    drop(guard);
                    self.replay_release_lesson(&lesson, 0.0);
                }
            }
            Event::FeedbackRecorded {
                id,
                rating,
                feedback,
            } => {
                if let Some(row) = self.lesson_state(id) {
                    let mut guard = row.try_write().expect("replay: uncontended write");
                    guard.lesson.rating = Some(*rating);
                    guard.lesson.feedback = feedback.clone();
                }
            }
            Event::SessionOpened {
                id,
                lesson_id,
                participant_id,
                at,
                quality,
            } => {
                if let Some(row) = self.lesson_state(lesson_id) {
                    row.try_write()
                        .expect("replay: uncontended write")
                        .sessions
                        .push(MeetingSession {
                            id: *id,
                            lesson_id: *lesson_id,
                            participant_id: *participant_id,
                            joined_at: *at,
                            left_at: None,
                            duration_secs: None,
                            quality: *quality,
                        });
                }
            }
            Event::SessionClosed {
                lesson_id,
                participant_id,
                at,
            } => {
                if let Some(row) = self.lesson_state(lesson_id) {
                    let mut guard = row.try_write().expect("replay: uncontended write");
                    apply_closed_session(&mut guard, *participant_id, *at);
                }
            }
        }
    }

    /// Free the slots a lesson held and undo the student-side bookkeeping.
    /// Replay-only; the live paths do this under held guards.
    fn replay_release_lesson(&self, lesson: &Lesson, refund_hours: f64) {
        for key in lesson.slot_keys() {
            if let Some(entry) = self.slots.get(&key) {
                let slot = entry.value().clone();
                apply_release(&mut slot.try_write().expect("replay: uncontended write"));
            }
        }
        if let Some(row) = self.student(&lesson.student_id) {
            let mut guard = row.try_write().expect("replay: uncontended write");
            guard.remove_booked(lesson.id);
            if refund_hours > 0.0
                && let Some(pkg) = guard.package_mut(lesson.package_assignment_id)
            {
                apply_credit(pkg, refund_hours);
            }
        }
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with the minimal event history that recreates the
    /// current state: every slot row, every package, then each lesson's
    /// booked event followed by whatever transitions and telemetry it has.
    ///
    /// Holds the compaction lock exclusive across the scan and the enqueue
    /// of the rewrite. Without it, a booking whose append is ordered before
    /// the rewrite but whose lesson insert lands after the scan would be
    /// missing from the compacted file, and its durable event would be
    /// destroyed with the old log.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compact_lock.write().await;
        let mut events = Vec::new();

        let mut slot_keys: Vec<SlotKey> = self.slots.iter().map(|e| *e.key()).collect();
        slot_keys.sort();
        for key in slot_keys {
            events.push(Event::WindowDeclared {
                tutor_id: key.tutor_id,
                date: key.date,
                hour: key.hour,
            });
            if let Some(row) = self.slot(&key)
                && !row.read().await.is_available
            {
                events.push(Event::WindowWithdrawn {
                    tutor_id: key.tutor_id,
                    date: key.date,
                    hour: key.hour,
                });
            }
        }

        let student_ids: Vec<Ulid> = self.students.iter().map(|e| *e.key()).collect();
        for sid in student_ids {
            let Some(row) = self.student(&sid) else { continue };
            let guard = row.read().await;
            for pkg in &guard.packages {
                events.push(Event::PackageAssigned {
                    id: pkg.id,
                    student_id: pkg.student_id,
                    package_id: pkg.package_id,
                    hours: pkg.total_hours,
                    assigned_at: pkg.assigned_at,
                    expires_at: pkg.expires_at,
                });
            }
        }

        let lesson_ids: Vec<Ulid> = self.lessons.iter().map(|e| *e.key()).collect();
        let mut lesson_states = Vec::with_capacity(lesson_ids.len());
        for id in lesson_ids {
            let Some(row) = self.lesson_state(&id) else { continue };
            lesson_states.push(row.read().await.clone());
        }
        lesson_states.sort_by_key(|s| s.lesson.booked_at);
        for state in &lesson_states {
            emit_lesson_history(&mut events, state);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Emit the event skeleton that reproduces one lesson's current state.
fn emit_lesson_history(events: &mut Vec<Event>, state: &LessonState) {
    let lesson = &state.lesson;
    events.push(Event::LessonBooked {
        id: lesson.id,
        tutor_id: lesson.tutor_id,
        student_id: lesson.student_id,
        date: lesson.date,
        start_hour: lesson.start_hour,
        end_hour: lesson.end_hour,
        language: lesson.language.clone(),
        topic: lesson.topic.clone(),
        package_assignment_id: lesson.package_assignment_id,
        hours: lesson.hours,
        room: lesson.room.clone(),
        booked_at: lesson.booked_at,
    });
    if let Some(at) = lesson.started_at {
        events.push(Event::LessonStarted { id: lesson.id, at });
    }
    match lesson.status {
        LessonStatus::Completed => {
            if let Some(at) = lesson.completed_at {
                events.push(Event::LessonCompleted { id: lesson.id, at });
            }
        }
        LessonStatus::Cancelled => {
            events.push(Event::LessonCancelled {
                id: lesson.id,
                actor: lesson.cancelled_by.unwrap_or(Actor::Student),
                reason: lesson.cancel_reason.clone().unwrap_or_default(),
                at: lesson.cancelled_at.unwrap_or(lesson.booked_at),
                refund_hours: lesson.refunded_hours,
            });
        }
        LessonStatus::NoShow => {
            events.push(Event::LessonNoShow {
                id: lesson.id,
                at: lesson.no_show_at.unwrap_or(lesson.booked_at),
            });
        }
        LessonStatus::Scheduled | LessonStatus::InProgress => {}
    }
    if let Some(rating) = lesson.rating {
        events.push(Event::FeedbackRecorded {
            id: lesson.id,
            rating,
            feedback: lesson.feedback.clone(),
        });
    }
    for session in &state.sessions {
        events.push(Event::SessionOpened {
            id: session.id,
            lesson_id: session.lesson_id,
            participant_id: session.participant_id,
            at: session.joined_at,
            quality: session.quality,
        });
        if let Some(at) = session.left_at {
            events.push(Event::SessionClosed {
                lesson_id: session.lesson_id,
                participant_id: session.participant_id,
                at,
            });
        }
    }
}
