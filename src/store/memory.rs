use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use super::{AttendeeStore, AvailabilityStore, BookingStore, Order, StoreError, UserStore};
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and batches appends: block for the first append, drain
/// whatever else is queued, then one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut pending = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Record, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &records).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let result = wal.append_buffered(&record).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Tables ───────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    bookings: HashMap<Ulid, Booking>,
    /// Scheduled bookings only, sorted by start.
    schedule: Vec<(Span, Ulid)>,
    attendees: HashMap<Ulid, Vec<Attendee>>,
    users: HashMap<Ulid, UserProfile>,
    emails: HashMap<String, Ulid>,
    windows: Vec<AvailabilityWindow>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

impl Tables {
    fn index(&mut self, booking: &Booking) {
        self.unindex(booking.id);
        if booking.is_scheduled() {
            let pos = self
                .schedule
                .partition_point(|(s, _)| s.start <= booking.span.start);
            self.schedule.insert(pos, (booking.span, booking.id));
        }
    }

    fn unindex(&mut self, id: Ulid) {
        if let Some(pos) = self.schedule.iter().position(|(_, i)| *i == id) {
            self.schedule.remove(pos);
        }
    }

    /// Scheduled bookings overlapping `query`. Binary search skips
    /// everything starting at or after `query.end`.
    fn scheduled_overlapping(&self, query: &Span) -> impl Iterator<Item = Ulid> + '_ {
        let right_bound = self.schedule.partition_point(|(s, _)| s.start < query.end);
        let start = query.start;
        self.schedule[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > start)
            .map(|(_, id)| *id)
    }

    fn exclusion(&self, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
        self.scheduled_overlapping(span).find(|id| Some(*id) != exclude)
    }

    fn select(&self, filter: &BookingFilter) -> Vec<&Booking> {
        let candidates: Vec<&Booking> = match (filter.status, &filter.overlapping) {
            (Some(BookingStatus::Scheduled), Some(span)) => self
                .scheduled_overlapping(span)
                .filter_map(|id| self.bookings.get(&id))
                .collect(),
            _ => self.bookings.values().collect(),
        };
        candidates.into_iter().filter(|b| filter.matches(b)).collect()
    }

    fn apply(&mut self, record: &Record) {
        match record {
            Record::BookingSaved { booking, attendees } => {
                self.index(booking);
                self.bookings.insert(booking.id, booking.clone());
                self.attendees.insert(booking.id, attendees.clone());
            }
            Record::BookingWritten { booking } => {
                self.index(booking);
                self.bookings.insert(booking.id, booking.clone());
            }
            Record::AttendeesReplaced {
                booking_id,
                attendees,
            } => {
                self.attendees.insert(*booking_id, attendees.clone());
            }
            Record::BookingDeleted { id } => {
                self.unindex(*id);
                self.bookings.remove(id);
                self.attendees.remove(id);
            }
            Record::UserWritten { user } => {
                self.emails.insert(normalize_email(&user.email), user.id);
                self.users.insert(user.id, user.clone());
            }
            Record::WindowAdded { window } => {
                let pos = self
                    .windows
                    .partition_point(|w| w.span.start <= window.span.start);
                self.windows.insert(pos, *window);
            }
            Record::WindowRemoved { id } => {
                self.windows.retain(|w| w.id != *id);
            }
        }
    }

    /// Minimal record set that recreates the current state.
    fn snapshot(&self) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.users.len() + self.bookings.len() + self.windows.len());
        let mut users: Vec<&UserProfile> = self.users.values().collect();
        users.sort_by_key(|u| (u.created_at, u.id));
        for user in users {
            records.push(Record::UserWritten { user: user.clone() });
        }
        let mut bookings: Vec<&Booking> = self.bookings.values().collect();
        bookings.sort_by_key(|b| b.id);
        for booking in bookings {
            records.push(Record::BookingSaved {
                booking: booking.clone(),
                attendees: self.attendees.get(&booking.id).cloned().unwrap_or_default(),
            });
        }
        for window in &self.windows {
            records.push(Record::WindowAdded { window: *window });
        }
        records
    }

    fn booking(&self, id: Ulid) -> Result<&Booking, StoreError> {
        self.bookings.get(&id).ok_or(StoreError::NotFound(id))
    }

    fn attendee_rows(&self, booking_id: Ulid, rows: Vec<NewAttendee>) -> Vec<Attendee> {
        rows.into_iter()
            .map(|row| Attendee {
                id: Ulid::new(),
                booking_id,
                email: row.email,
                full_name: row.full_name,
                user_id: row.user_id,
                status: row.status,
            })
            .collect()
    }
}

fn materialize(new: NewBooking, now: Ms) -> Booking {
    Booking {
        id: Ulid::new(),
        title: new.title,
        description: new.description,
        span: new.span,
        location: new.location,
        meeting_link: new.meeting_link,
        max_attendees: new.max_attendees,
        status: BookingStatus::Scheduled,
        created_by: new.created_by,
        created_at: now,
        updated_at: now,
        calendar_event_id: None,
    }
}

fn sort_bookings(rows: &mut [Booking], order: Order) {
    match order {
        Order::StartAsc => rows.sort_by_key(|b| (b.span.start, b.id)),
        Order::StartDesc => rows.sort_by(|a, b| (b.span.start, b.id).cmp(&(a.span.start, a.id))),
    }
}

// ── MemoryStore ──────────────────────────────────────────

/// In-memory implementation of every storage trait, made durable by a WAL.
///
/// Scheduled bookings may not overlap: writes that would break this fail
/// with `StoreError::Exclusion` while the table lock is held.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl MemoryStore {
    /// Replay the WAL at `wal_path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, records) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tables = Tables::default();
        for record in &records {
            tables.apply(record);
        }
        info!(
            records = records.len(),
            bookings = tables.bookings.len(),
            users = tables.users.len(),
            "store replayed"
        );

        Ok(Self {
            tables: RwLock::new(tables),
            wal_tx,
        })
    }

    async fn wal_append(&self, record: &Record) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Durably log `record`, then apply it. Caller holds the write lock.
    async fn commit(&self, tables: &mut Tables, record: Record) -> Result<(), StoreError> {
        self.wal_append(&record).await?;
        tables.apply(&record);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
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

    /// Rewrite the WAL as a snapshot of current state. Returns the record count.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        // The read guard keeps writers out until the swap is done.
        let tables = self.tables.read().await;
        let records = tables.snapshot();
        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                records,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        Ok(count)
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert(&self, booking: NewBooking, now: Ms) -> Result<Booking, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.exclusion(&booking.span, None) {
            return Err(StoreError::Exclusion(existing));
        }
        let booking = materialize(booking, now);
        self.commit(
            &mut tables,
            Record::BookingSaved {
                booking: booking.clone(),
                attendees: Vec::new(),
            },
        )
        .await?;
        Ok(booking)
    }

    async fn update(&self, id: Ulid, patch: BookingPatch, now: Ms) -> Result<Booking, StoreError> {
        let mut tables = self.tables.write().await;
        let mut booking = tables.booking(id)?.clone();
        patch.apply(&mut booking);
        booking.updated_at = now;
        if booking.is_scheduled()
            && let Some(existing) = tables.exclusion(&booking.span, Some(id))
        {
            return Err(StoreError::Exclusion(existing));
        }
        self.commit(
            &mut tables,
            Record::BookingWritten {
                booking: booking.clone(),
            },
        )
        .await?;
        Ok(booking)
    }

    async fn delete(&self, id: Ulid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.booking(id)?;
        self.commit(&mut tables, Record::BookingDeleted { id }).await
    }

    async fn get(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.tables.read().await.bookings.get(&id).cloned())
    }

    async fn query(&self, filter: &BookingFilter, order: Order) -> Result<Vec<Booking>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Booking> = tables.select(filter).into_iter().cloned().collect();
        sort_bookings(&mut rows, order);
        Ok(rows)
    }

    async fn count(&self, filter: &BookingFilter) -> Result<usize, StoreError> {
        Ok(self.tables.read().await.select(filter).len())
    }

    async fn set_calendar_ref(&self, id: Ulid, event_id: Option<String>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let mut booking = tables.booking(id)?.clone();
        booking.calendar_event_id = event_id;
        self.commit(&mut tables, Record::BookingWritten { booking }).await
    }

    async fn create_atomic(
        &self,
        booking: NewBooking,
        attendees: Vec<NewAttendee>,
        now: Ms,
    ) -> Result<Option<(Booking, Vec<Attendee>)>, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.exclusion(&booking.span, None) {
            return Err(StoreError::Exclusion(existing));
        }
        let booking = materialize(booking, now);
        let attendees = tables.attendee_rows(booking.id, attendees);
        self.commit(
            &mut tables,
            Record::BookingSaved {
                booking: booking.clone(),
                attendees: attendees.clone(),
            },
        )
        .await?;
        Ok(Some((booking, attendees)))
    }

    async fn replace_atomic(
        &self,
        id: Ulid,
        patch: BookingPatch,
        attendees: Vec<NewAttendee>,
        now: Ms,
    ) -> Result<Option<(Booking, Vec<Attendee>)>, StoreError> {
        let mut tables = self.tables.write().await;
        let mut booking = tables.booking(id)?.clone();
        patch.apply(&mut booking);
        booking.updated_at = now;
        if booking.is_scheduled()
            && let Some(existing) = tables.exclusion(&booking.span, Some(id))
        {
            return Err(StoreError::Exclusion(existing));
        }
        let attendees = tables.attendee_rows(id, attendees);
        self.commit(
            &mut tables,
            Record::BookingSaved {
                booking: booking.clone(),
                attendees: attendees.clone(),
            },
        )
        .await?;
        Ok(Some((booking, attendees)))
    }
}

#[async_trait]
impl AttendeeStore for MemoryStore {
    async fn insert_many(
        &self,
        booking_id: Ulid,
        rows: Vec<NewAttendee>,
    ) -> Result<Vec<Attendee>, StoreError> {
        let mut tables = self.tables.write().await;
        tables.booking(booking_id)?;
        let inserted = tables.attendee_rows(booking_id, rows);
        let mut all = tables.attendees.get(&booking_id).cloned().unwrap_or_default();
        all.extend(inserted.iter().cloned());
        self.commit(
            &mut tables,
            Record::AttendeesReplaced {
                booking_id,
                attendees: all,
            },
        )
        .await?;
        Ok(inserted)
    }

    async fn delete_all(&self, booking_id: Ulid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.booking(booking_id)?;
        self.commit(
            &mut tables,
            Record::AttendeesReplaced {
                booking_id,
                attendees: Vec::new(),
            },
        )
        .await
    }

    async fn list_for_booking(&self, booking_id: Ulid) -> Result<Vec<Attendee>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .attendees
            .get(&booking_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_by_user(&self, user_id: Ulid) -> Result<Vec<Attendee>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .attendees
            .values()
            .flatten()
            .filter(|a| a.user_id == Some(user_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn upsert(&self, profile: ProfileUpsert, now: Ms) -> Result<UserProfile, StoreError> {
        let mut tables = self.tables.write().await;
        let email = normalize_email(&profile.email);
        let existing = tables
            .emails
            .get(&email)
            .and_then(|id| tables.users.get(id))
            .cloned();
        let user = match existing {
            Some(mut user) => {
                if profile.full_name.is_some() {
                    user.full_name = profile.full_name;
                }
                if profile.avatar_url.is_some() {
                    user.avatar_url = profile.avatar_url;
                }
                user.updated_at = now;
                user
            }
            None => UserProfile {
                id: Ulid::new(),
                email,
                full_name: profile.full_name,
                avatar_url: profile.avatar_url,
                role: profile.initial_role,
                created_at: now,
                updated_at: now,
            },
        };
        self.commit(&mut tables, Record::UserWritten { user: user.clone() })
            .await?;
        Ok(user)
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<UserProfile>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .emails
            .get(&normalize_email(email))
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn update_role(&self, id: Ulid, role: Role, now: Ms) -> Result<UserProfile, StoreError> {
        let mut tables = self.tables.write().await;
        let mut user = tables.users.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        user.role = role;
        user.updated_at = now;
        self.commit(&mut tables, Record::UserWritten { user: user.clone() })
            .await?;
        Ok(user)
    }

    async fn list(&self) -> Result<Vec<UserProfile>, StoreError> {
        let tables = self.tables.read().await;
        let mut users: Vec<UserProfile> = tables.users.values().cloned().collect();
        users.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(users)
    }
}

#[async_trait]
impl AvailabilityStore for MemoryStore {
    async fn list_all(&self) -> Result<Vec<AvailabilityWindow>, StoreError> {
        Ok(self.tables.read().await.windows.clone())
    }

    async fn insert_window(&self, span: Span) -> Result<AvailabilityWindow, StoreError> {
        let mut tables = self.tables.write().await;
        let window = AvailabilityWindow {
            id: Ulid::new(),
            span,
        };
        self.commit(&mut tables, Record::WindowAdded { window }).await?;
        Ok(window)
    }

    async fn remove_window(&self, id: Ulid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.windows.iter().any(|w| w.id == id) {
            return Err(StoreError::NotFound(id));
        }
        self.commit(&mut tables, Record::WindowRemoved { id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("kairos_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn new_booking(creator: Ulid, start: Ms, end: Ms) -> NewBooking {
        NewBooking {
            title: "Sync".into(),
            description: None,
            span: Span::new(start, end),
            location: None,
            meeting_link: None,
            max_attendees: 10,
            created_by: creator,
        }
    }

    fn attendee(email: &str, name: &str) -> NewAttendee {
        NewAttendee {
            email: email.into(),
            full_name: name.into(),
            user_id: None,
            status: AttendeeStatus::Pending,
        }
    }

    #[tokio::test]
    async fn insert_assigns_identity_and_status() {
        let store = MemoryStore::open(test_wal_path("insert_identity.wal")).unwrap();
        let creator = Ulid::new();
        let b = store.insert(new_booking(creator, 1000, 2000), 500).await.unwrap();
        assert_eq!(b.status, BookingStatus::Scheduled);
        assert_eq!(b.created_at, 500);
        assert_eq!(b.created_by, creator);
        assert_eq!(store.get(b.id).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn exclusion_rejects_overlapping_scheduled() {
        let store = MemoryStore::open(test_wal_path("exclusion.wal")).unwrap();
        let creator = Ulid::new();
        let first = store.insert(new_booking(creator, 1000, 2000), 0).await.unwrap();

        let err = store.insert(new_booking(creator, 1500, 2500), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Exclusion(id) if id == first.id));

        // Back-to-back is fine
        store.insert(new_booking(creator, 2000, 3000), 0).await.unwrap();

        // Once cancelled, the slot is free
        store
            .update(first.id, BookingPatch::status(BookingStatus::Cancelled), 1)
            .await
            .unwrap();
        store.insert(new_booking(creator, 1500, 1900), 0).await.unwrap();
    }

    #[tokio::test]
    async fn update_excludes_itself() {
        let store = MemoryStore::open(test_wal_path("update_self.wal")).unwrap();
        let b = store.insert(new_booking(Ulid::new(), 1000, 2000), 0).await.unwrap();
        let patch = BookingPatch {
            span: Some(Span::new(1500, 2500)),
            ..Default::default()
        };
        let updated = store.update(b.id, patch, 10).await.unwrap();
        assert_eq!(updated.span, Span::new(1500, 2500));
        assert_eq!(updated.updated_at, 10);
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let store = MemoryStore::open(test_wal_path("query.wal")).unwrap();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let late = store.insert(new_booking(alice, 5000, 6000), 0).await.unwrap();
        let early = store.insert(new_booking(alice, 1000, 2000), 0).await.unwrap();
        let other = store.insert(new_booking(bob, 3000, 4000), 0).await.unwrap();

        let mine = BookingFilter {
            created_by: Some(alice),
            ..Default::default()
        };
        let rows = store.query(&mine, Order::StartAsc).await.unwrap();
        assert_eq!(rows.iter().map(|b| b.id).collect::<Vec<_>>(), vec![early.id, late.id]);

        let rows = store.query(&BookingFilter::default(), Order::StartDesc).await.unwrap();
        assert_eq!(
            rows.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![late.id, other.id, early.id]
        );

        let overlapping = BookingFilter {
            status: Some(BookingStatus::Scheduled),
            overlapping: Some(Span::new(1500, 3500)),
            ..Default::default()
        };
        assert_eq!(store.count(&overlapping).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn atomic_create_and_replace() {
        let store = MemoryStore::open(test_wal_path("atomic.wal")).unwrap();
        let (b, rows) = store
            .create_atomic(
                new_booking(Ulid::new(), 1000, 2000),
                vec![attendee("a@x.com", "A"), attendee("b@x.com", "B")],
                0,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|a| a.booking_id == b.id));

        let (_, replaced) = store
            .replace_atomic(
                b.id,
                BookingPatch::default(),
                vec![attendee("c@x.com", "C")],
                1,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced.len(), 1);
        let listed = store.list_for_booking(b.id).await.unwrap();
        assert_eq!(listed, replaced);
    }

    #[tokio::test]
    async fn attendee_ops() {
        let store = MemoryStore::open(test_wal_path("attendees.wal")).unwrap();
        let user = Ulid::new();
        let b = store.insert(new_booking(Ulid::new(), 1000, 2000), 0).await.unwrap();
        let mut linked = attendee("u@x.com", "U");
        linked.user_id = Some(user);
        store.insert_many(b.id, vec![linked]).await.unwrap();
        store.insert_many(b.id, vec![attendee("v@x.com", "V")]).await.unwrap();
        assert_eq!(store.list_for_booking(b.id).await.unwrap().len(), 2);

        let invited = store.query_by_user(user).await.unwrap();
        assert_eq!(invited.len(), 1);
        assert_eq!(invited[0].booking_id, b.id);

        store.delete_all(b.id).await.unwrap();
        assert!(store.list_for_booking(b.id).await.unwrap().is_empty());

        let missing = store.insert_many(Ulid::new(), vec![]).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn user_upsert_refreshes_profile_but_keeps_role() {
        let store = MemoryStore::open(test_wal_path("users.wal")).unwrap();
        let created = store
            .upsert(
                ProfileUpsert {
                    email: "Ada@Example.com".into(),
                    full_name: Some("Ada".into()),
                    avatar_url: None,
                    initial_role: Role::User,
                },
                100,
            )
            .await
            .unwrap();
        assert_eq!(created.email, "ada@example.com");

        store.update_role(created.id, Role::Admin, 150).await.unwrap();

        let refreshed = store
            .upsert(
                ProfileUpsert {
                    email: "ada@example.com".into(),
                    full_name: Some("Ada L.".into()),
                    avatar_url: Some("https://img/ada.png".into()),
                    initial_role: Role::User,
                },
                200,
            )
            .await
            .unwrap();
        assert_eq!(refreshed.id, created.id);
        assert_eq!(refreshed.role, Role::Admin);
        assert_eq!(refreshed.full_name.as_deref(), Some("Ada L."));
        assert_eq!(refreshed.created_at, 100);

        let by_email = store.get_by_email(" ADA@example.com ").await.unwrap().unwrap();
        assert_eq!(by_email.id, created.id);
    }

    #[tokio::test]
    async fn users_listed_newest_first() {
        let store = MemoryStore::open(test_wal_path("users_order.wal")).unwrap();
        for (i, email) in ["a@x.com", "b@x.com", "c@x.com"].iter().enumerate() {
            store
                .upsert(
                    ProfileUpsert {
                        email: (*email).into(),
                        full_name: None,
                        avatar_url: None,
                        initial_role: Role::User,
                    },
                    i as Ms,
                )
                .await
                .unwrap();
        }
        let emails: Vec<String> = store.list().await.unwrap().into_iter().map(|u| u.email).collect();
        assert_eq!(emails, vec!["c@x.com", "b@x.com", "a@x.com"]);
    }

    #[tokio::test]
    async fn windows_sorted_and_removable() {
        let store = MemoryStore::open(test_wal_path("windows.wal")).unwrap();
        let late = store.insert_window(Span::new(5000, 6000)).await.unwrap();
        let early = store.insert_window(Span::new(1000, 2000)).await.unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all, vec![early, late]);

        store.remove_window(early.id).await.unwrap();
        assert_eq!(store.list_all().await.unwrap(), vec![late]);
        assert!(matches!(store.remove_window(early.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn replay_restores_state() {
        let path = test_wal_path("replay.wal");
        let creator = Ulid::new();
        let (booking_id, window) = {
            let store = MemoryStore::open(path.clone()).unwrap();
            let (b, _) = store
                .create_atomic(new_booking(creator, 1000, 2000), vec![attendee("a@x.com", "A")], 0)
                .await
                .unwrap()
                .unwrap();
            store
                .update(b.id, BookingPatch::status(BookingStatus::Cancelled), 5)
                .await
                .unwrap();
            let w = store.insert_window(Span::new(0, 10_000)).await.unwrap();
            (b.id, w)
        };

        let store = MemoryStore::open(path).unwrap();
        let b = store.get(booking_id).await.unwrap().unwrap();
        assert_eq!(b.status, BookingStatus::Cancelled);
        assert_eq!(store.list_for_booking(booking_id).await.unwrap().len(), 1);
        assert_eq!(store.list_all().await.unwrap(), vec![window]);
        // Cancelled bookings are not in the schedule index after replay
        store.insert(new_booking(creator, 1000, 2000), 0).await.unwrap();
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction.wal");
        let creator = Ulid::new();
        let kept = {
            let store = MemoryStore::open(path.clone()).unwrap();
            for i in 0..10 {
                let b = store
                    .insert(new_booking(creator, i * 10_000, i * 10_000 + 1000), 0)
                    .await
                    .unwrap();
                store.delete(b.id).await.unwrap();
            }
            let kept = store.insert(new_booking(creator, 1000, 2000), 0).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 21);

            let count = store.compact().await.unwrap();
            assert_eq!(count, 1);
            assert_eq!(store.appends_since_compact().await, 0);
            kept
        };

        let store = MemoryStore::open(path).unwrap();
        assert_eq!(store.get(kept.id).await.unwrap(), Some(kept));
        assert_eq!(store.count(&BookingFilter::default()).await.unwrap(), 1);
    }
}
