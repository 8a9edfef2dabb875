use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS;
use crate::model::*;
use crate::wal::Wal;

use super::EngineError;

/// Runs under the record lock. `Ok(None)` leaves the booking untouched.
pub type Mutation = Box<dyn FnOnce(&Booking) -> Result<Option<Change>, EngineError> + Send>;

/// Checked under the record lock before a delete commits.
pub type Precondition = Box<dyn FnOnce(&Booking) -> Result<(), EngineError> + Send>;

/// Filter for `find`. Spelled out as higher-ranked so it survives `async_trait`.
pub type Predicate = dyn for<'a> Fn(&'a Booking) -> bool + Send + Sync;

pub fn mutation<F>(f: F) -> Mutation
where
    F: FnOnce(&Booking) -> Result<Option<Change>, EngineError> + Send + 'static,
{
    Box::new(f)
}

pub fn precondition<F>(f: F) -> Precondition
where
    F: FnOnce(&Booking) -> Result<(), EngineError> + Send + 'static,
{
    Box::new(f)
}

/// Durable keyed collection of bookings.
///
/// `update` and `delete` are atomic per record: the closure sees the latest
/// committed value and nothing else can commit to that booking until it
/// returns. There is no cross-record transaction.
#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    async fn create(&self, booking: Booking) -> Result<Ulid, EngineError>;

    async fn get(&self, id: Ulid) -> Result<Booking, EngineError>;

    /// Matching bookings, newest first.
    async fn find(&self, predicate: &Predicate) -> Result<Vec<Booking>, EngineError>;

    async fn update(&self, id: Ulid, mutation: Mutation) -> Result<Booking, EngineError>;

    async fn delete(&self, id: Ulid, precondition: Precondition) -> Result<(), EngineError>;
}

pub type SharedBooking = Arc<Mutex<Booking>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Blocks for the first append, drains whatever else is queued,
/// then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after a failed append so stale buffered bytes never leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
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
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Rebuild the live set from a replayed event log.
fn replay_bookings(events: Vec<Event>) -> HashMap<Ulid, Booking> {
    let mut bookings = HashMap::new();
    for event in events {
        match event {
            Event::BookingCreated { booking } => {
                bookings.insert(booking.id, booking);
            }
            Event::BookingChanged { id, change } => {
                if let Some(b) = bookings.get_mut(&id) {
                    b.apply(change);
                }
            }
            Event::BookingDeleted { id } => {
                bookings.remove(&id);
            }
        }
    }
    bookings
}

fn wal_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::StoreUnavailable(e.to_string())
}

/// In-memory booking map made durable by a group-commit WAL.
pub struct WalStore {
    bookings: DashMap<Ulid, SharedBooking>,
    /// Live plus in-flight creates; bounds the map without locking every shard.
    live: AtomicUsize,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay `wal_path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let bookings = DashMap::new();
        for (id, booking) in replay_bookings(events) {
            bookings.insert(id, Arc::new(Mutex::new(booking)));
        }
        let live = AtomicUsize::new(bookings.len());
        metrics::gauge!(crate::observability::BOOKINGS_LIVE).set(bookings.len() as f64);
        Ok(Self { bookings, live, wal_tx })
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    fn shared(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// True while `entry` is still the record stored under `id`.
    fn still_current(&self, id: &Ulid, entry: &SharedBooking) -> bool {
        self.bookings
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), entry))
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| wal_err("WAL writer shut down"))?;
        rx.await
            .map_err(|_| wal_err("WAL writer dropped response"))?
            .map_err(wal_err)
    }

    /// Rewrite the log as one snapshot event per live booking.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let entries: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            let booking = entry.lock().await.clone();
            events.push(Event::BookingCreated { booking });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| wal_err("WAL writer shut down"))?;
        rx.await
            .map_err(|_| wal_err("WAL writer dropped response"))?
            .map_err(wal_err)
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
}

#[async_trait]
impl BookingStore for WalStore {
    async fn create(&self, booking: Booking) -> Result<Ulid, EngineError> {
        if self.live.fetch_add(1, Ordering::AcqRel) >= MAX_BOOKINGS {
            self.release_slot();
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        let id = booking.id;
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        let entry: SharedBooking = Arc::new(Mutex::new(booking));
        // Locked before it is published, so readers wait for the WAL verdict.
        let Ok(guard) = entry.clone().try_lock_owned() else {
            self.release_slot();
            return Err(EngineError::Conflict(id));
        };
        match self.bookings.entry(id) {
            Entry::Occupied(_) => {
                self.release_slot();
                return Err(EngineError::AlreadyExists(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        if let Err(e) = self.wal_append(&event).await {
            self.bookings.remove_if(&id, |_, current| Arc::ptr_eq(current, &entry));
            self.release_slot();
            drop(guard);
            return Err(e);
        }
        drop(guard);
        metrics::gauge!(crate::observability::BOOKINGS_LIVE).set(self.bookings.len() as f64);
        Ok(id)
    }

    async fn get(&self, id: Ulid) -> Result<Booking, EngineError> {
        let entry = self.shared(&id).ok_or(EngineError::NotFound(id))?;
        let guard = entry.lock().await;
        if !self.still_current(&id, &entry) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.clone())
    }

    async fn find(&self, predicate: &Predicate) -> Result<Vec<Booking>, EngineError> {
        // Snapshot the handles first; never hold a shard lock across an await.
        let entries: Vec<(Ulid, SharedBooking)> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut found = Vec::new();
        for (id, entry) in entries {
            let guard = entry.lock().await;
            if self.still_current(&id, &entry) && predicate(&*guard) {
                found.push(guard.clone());
            }
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn update(&self, id: Ulid, mutation: Mutation) -> Result<Booking, EngineError> {
        let entry = self.shared(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = entry.lock().await;
        if !self.still_current(&id, &entry) {
            return Err(EngineError::Conflict(id));
        }

        let Some(change) = mutation(&*guard)? else {
            return Ok(guard.clone());
        };
        let event = Event::BookingChanged { id, change };
        self.wal_append(&event).await?;
        guard.apply(change);
        Ok(guard.clone())
    }

    async fn delete(&self, id: Ulid, precondition: Precondition) -> Result<(), EngineError> {
        let entry = self.shared(&id).ok_or(EngineError::NotFound(id))?;
        let guard = entry.lock().await;
        if !self.still_current(&id, &entry) {
            return Err(EngineError::Conflict(id));
        }
        precondition(&*guard)?;

        self.wal_append(&Event::BookingDeleted { id }).await?;
        // Removed while still locked so waiters observe the deletion as a lost race.
        self.bookings.remove(&id);
        self.release_slot();
        drop(guard);
        metrics::gauge!(crate::observability::BOOKINGS_LIVE).set(self.bookings.len() as f64);
        Ok(())
    }
}
