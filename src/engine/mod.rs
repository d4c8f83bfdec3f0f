mod availability;
mod error;
mod mutations;
mod queries;
mod status;

pub use availability::{AssetAvailability, AvailabilityReport, classify_asset, evaluate};
pub use error::{BookingError, GuardReason, GuardViolation};
pub use mutations::BookingIntent;
pub use queries::BookingFilter;
pub use status::{BookingFlags, classify};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedBooking = Arc<RwLock<BookingState>>;
pub type SharedAsset = Arc<RwLock<AssetState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) type Reply = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Reply },
    Control(WalControl),
}

pub(super) enum WalControl {
    Compact { events: Vec<Event>, response: Reply },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Background task that owns the WAL. Appends that queue up while a flush is
/// in progress are written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Control(control) => {
                handle_control(&mut wal, control);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Control(control) => {
                    // Control commands see everything appended before them.
                    deferred = Some(control);
                    break;
                }
            }
        }

        if !commit_batch(&mut wal, batch) {
            // The file may hold records nobody was told about. Stop taking
            // writes; every later mutation fails with a WAL error.
            tracing::error!("WAL {} left in an unknown state, writer stopped", wal.path().display());
            break;
        }
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

/// Append and fsync one batch, replying to every caller with the shared
/// outcome. A failed batch is rolled back so no part of it survives a restart.
/// Returns false if even the rollback failed.
fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Reply)>) -> bool {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    let mut healthy = true;
    if let Err(e) = &result {
        tracing::warn!("WAL flush failed for {} events: {e}", batch.len());
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed: {e}");
            healthy = false;
        }
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
    healthy
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Applying events ──────────────────────────────────────

/// Write guards over the assets one event touches, keyed (and acquired) in ascending id order.
pub(super) type AssetGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<AssetState>>;

/// Apply an already-durable event to the booking and assets it touches.
/// Never fails: every guard was checked before the event was written.
pub(super) fn apply_event(mut booking: Option<&mut BookingState>, assets: &mut AssetGuards, event: &Event) {
    match event {
        Event::AssetAvailabilityChanged { id, available_to_book } => {
            if let Some(asset) = assets.get_mut(id) {
                asset.available_to_book = *available_to_book;
            }
        }
        Event::CustodyAssigned {
            asset_id,
            custody_id,
            custodian,
            at,
        } => {
            if let Some(asset) = assets.get_mut(asset_id) {
                asset.custody = Some(Custody {
                    id: *custody_id,
                    custodian: *custodian,
                    booking_id: None,
                    previous_status: asset.status,
                    since: *at,
                });
                asset.status = AssetStatus::InCustody;
            }
        }
        Event::CustodyReleased { asset_id } => {
            if let Some(asset) = assets.get_mut(asset_id)
                && let Some(custody) = asset.custody.take()
            {
                asset.status = custody.previous_status;
            }
        }
        Event::BookingSaved {
            name,
            span,
            custodian,
            ..
        } => {
            if let Some(b) = booking.as_deref_mut() {
                b.name = name.clone();
                b.span = Some(*span);
                b.custodian = Some(*custodian);
            }
        }
        Event::BookingAssetsChanged { added, removed, .. } => {
            if let Some(b) = booking.as_deref_mut() {
                for asset_id in removed {
                    b.asset_ids.remove(asset_id);
                    if let Some(asset) = assets.get_mut(asset_id) {
                        asset.remove_booking(b.id);
                    }
                }
                for asset_id in added {
                    b.asset_ids.insert(*asset_id);
                    if let Some(asset) = assets.get_mut(asset_id) {
                        asset.insert_booking(b.join_row());
                    }
                }
            }
        }
        Event::BookingReserved { .. } => set_status(booking.as_deref_mut(), BookingStatus::Reserved),
        Event::BookingCheckedOut {
            id,
            custodian,
            custodies,
            at,
        } => {
            for (asset_id, custody_id) in custodies {
                if let Some(asset) = assets.get_mut(asset_id) {
                    asset.custody = Some(Custody {
                        id: *custody_id,
                        custodian: *custodian,
                        booking_id: Some(*id),
                        previous_status: asset.status,
                        since: *at,
                    });
                    asset.status = AssetStatus::CheckedOut;
                }
            }
            set_status(booking.as_deref_mut(), BookingStatus::Ongoing);
        }
        Event::BookingCheckedIn { id } => {
            for asset in assets.values_mut() {
                if asset.custody.as_ref().is_some_and(|c| c.booking_id == Some(*id))
                    && let Some(custody) = asset.custody.take()
                {
                    asset.status = custody.previous_status;
                }
            }
            set_status(booking.as_deref_mut(), BookingStatus::Complete);
        }
        Event::BookingCancelled { .. } => set_status(booking.as_deref_mut(), BookingStatus::Cancelled),
        Event::BookingArchived { .. } => set_status(booking.as_deref_mut(), BookingStatus::Archived),
        Event::BookingDeleted { id } => {
            for asset in assets.values_mut() {
                asset.remove_booking(*id);
            }
        }
        // Creation and snapshots add map entries; see `Engine::install`.
        Event::AssetCreated { .. }
        | Event::BookingDrafted { .. }
        | Event::AssetSnapshot(_)
        | Event::BookingSnapshot(_) => {}
    }

    if event.booking_id().is_some()
        && let Some(b) = booking
    {
        b.version += 1;
        for asset_id in &b.asset_ids {
            if let Some(asset) = assets.get_mut(asset_id) {
                asset.update_booking(b.id, b.span, b.status);
            }
        }
    }
}

fn set_status(booking: Option<&mut BookingState>, status: BookingStatus) {
    if let Some(b) = booking {
        b.status = status;
    }
}

/// Assets an event touches, given the booking it applies to.
fn involved_assets(event: &Event, booking: Option<&BookingState>) -> BTreeSet<Ulid> {
    let mut ids: BTreeSet<Ulid> = booking
        .map(|b| b.asset_ids.iter().copied().collect())
        .unwrap_or_default();
    match event {
        Event::AssetAvailabilityChanged { id, .. } => {
            ids.insert(*id);
        }
        Event::CustodyAssigned { asset_id, .. } | Event::CustodyReleased { asset_id } => {
            ids.insert(*asset_id);
        }
        Event::BookingAssetsChanged { added, .. } => ids.extend(added.iter().copied()),
        _ => {}
    }
    ids
}

pub struct Engine {
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) assets: DashMap<Ulid, SharedAsset>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Mutations hold this for reading from first lock to apply; compaction
    /// holds it for writing so the snapshot never sees a half-applied event.
    pub(super) commit_gate: RwLock<()>,
    /// Held from the existence/limit check until the new entry is in the map.
    pub(super) creation: Mutex<()>,
    /// Ongoing bookings already announced as overdue.
    pub(crate) overdue_notified: DashSet<Ulid>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            bookings: DashMap::new(),
            assets: DashMap::new(),
            wal_tx,
            notify,
            commit_gate: RwLock::new(()),
            creation: Mutex::new(()),
            overdue_notified: DashSet::new(),
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // Blocking acquisition is off the table: this can run inside a runtime.
        for event in &events {
            engine.replay_event(event)?;
        }
        tracing::debug!(
            "replayed {} events: {} bookings, {} assets",
            events.len(),
            engine.bookings.len(),
            engine.assets.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        if self.install(event)? {
            return Ok(());
        }
        let mut booking = match event.booking_id() {
            Some(id) => match self.bookings.get(&id).map(|e| e.value().clone()) {
                Some(shared) => Some(shared.try_write_owned().map_err(contended)?),
                // Events for unknown bookings cannot be applied; skip them like the
                // log skips a torn tail.
                None => return Ok(()),
            },
            None => None,
        };
        let mut assets = BTreeMap::new();
        for asset_id in involved_assets(event, booking.as_deref()) {
            if let Some(shared) = self.assets.get(&asset_id).map(|e| e.value().clone()) {
                assets.insert(asset_id, shared.try_write_owned().map_err(contended)?);
            }
        }
        apply_event(booking.as_deref_mut(), &mut assets, event);
        if let Event::BookingDeleted { id } = event {
            self.bookings.remove(id);
        }
        Ok(())
    }

    /// Handle events that create map entries. Returns false for everything else.
    fn install(&self, event: &Event) -> io::Result<bool> {
        match event {
            Event::AssetCreated {
                id,
                title,
                available_to_book,
            } => {
                let asset = AssetState::new(*id, title.clone(), *available_to_book);
                self.assets.insert(*id, Arc::new(RwLock::new(asset)));
            }
            Event::AssetSnapshot(asset) => {
                let mut asset = asset.clone();
                asset.bookings.clear();
                self.assets.insert(asset.id, Arc::new(RwLock::new(asset)));
            }
            Event::BookingDrafted {
                id,
                name,
                creator_id,
                custodian,
                at,
            } => {
                let booking = BookingState::draft(*id, name.clone(), *creator_id, *custodian, *at);
                self.bookings.insert(*id, Arc::new(RwLock::new(booking)));
            }
            Event::BookingSnapshot(booking) => {
                for asset_id in &booking.asset_ids {
                    if let Some(shared) = self.assets.get(asset_id).map(|e| e.value().clone()) {
                        shared
                            .try_write()
                            .map_err(contended)?
                            .insert_booking(booking.join_row());
                    }
                }
                self.bookings
                    .insert(booking.id, Arc::new(RwLock::new(booking.clone())));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::WalError(e.to_string()))
    }

    pub(super) async fn wal_control<T>(
        &self,
        control: impl FnOnce(oneshot::Sender<T>) -> WalControl,
    ) -> Result<T, BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(control(tx)))
            .await
            .map_err(|_| BookingError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::WalError("WAL writer dropped response".into()))
    }

    /// WAL-append then apply. A failed append leaves the state untouched.
    pub(super) async fn commit(
        &self,
        booking: Option<&mut BookingState>,
        assets: &mut AssetGuards,
        event: &Event,
    ) -> Result<(), BookingError> {
        self.wal_append(event).await?;
        apply_event(booking, assets, event);
        Ok(())
    }

    pub(super) fn shared_booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(super) fn shared_asset(&self, id: &Ulid) -> Option<SharedAsset> {
        self.assets.get(id).map(|e| e.value().clone())
    }

    /// Acquire the booking's write lock, failing with `Conflict` if the caller
    /// saw an older version.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
        expected_version: Option<u64>,
    ) -> Result<OwnedRwLockWriteGuard<BookingState>, BookingError> {
        let shared = self.shared_booking(&id).ok_or(BookingError::NotFound(id))?;
        let guard = shared.write_owned().await;
        // Deleted while we were waiting.
        if !self.bookings.contains_key(&id) {
            return Err(BookingError::NotFound(id));
        }
        if let Some(expected) = expected_version
            && expected != guard.version
        {
            return Err(BookingError::Conflict {
                booking_id: id,
                expected,
                actual: guard.version,
            });
        }
        Ok(guard)
    }

    /// Acquire asset write locks in ascending id order.
    pub(super) async fn lock_assets(&self, ids: impl IntoIterator<Item = Ulid>) -> Result<AssetGuards, BookingError> {
        let ids: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut shared = Vec::with_capacity(ids.len());
        for id in ids {
            shared.push((id, self.shared_asset(&id).ok_or(BookingError::NotFound(id))?));
        }
        let mut guards = BTreeMap::new();
        for (id, asset) in shared {
            guards.insert(id, asset.write_owned().await);
        }
        Ok(guards)
    }
}

fn contended(_: tokio::sync::TryLockError) -> io::Error {
    io::Error::other("replay: lock unexpectedly held")
}
