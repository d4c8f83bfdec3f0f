use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::form::{BookingForm, DEFAULT_DRAFT_NAME, FieldError, validate_name};
use crate::hints::ClientHint;
use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability;
use crate::permission::{
    BookingAction, can_access, can_manage_inventory, role_permits, self_service_restricted,
    status_permits,
};

use super::availability::evaluate;
use super::status::BookingFlags;
use super::{AssetGuards, BookingError, Engine, GuardReason, WalControl};

/// Everything a caller can ask a booking to do.
#[derive(Debug, Clone)]
pub enum BookingIntent {
    Save { form: BookingForm, hint: ClientHint },
    Reserve,
    CheckOut,
    CheckIn,
    Cancel,
    Archive,
    Delete,
    ManageAssets { add: Vec<Ulid>, remove: Vec<Ulid> },
}

impl BookingIntent {
    pub fn action(&self) -> BookingAction {
        match self {
            BookingIntent::Save { .. } => BookingAction::Save,
            BookingIntent::Reserve => BookingAction::Reserve,
            BookingIntent::CheckOut => BookingAction::CheckOut,
            BookingIntent::CheckIn => BookingAction::CheckIn,
            BookingIntent::Cancel => BookingAction::Cancel,
            BookingIntent::Archive => BookingAction::Archive,
            BookingIntent::Delete => BookingAction::Delete,
            BookingIntent::ManageAssets { .. } => BookingAction::ManageAssets,
        }
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            BookingIntent::Save { .. } => "save",
            BookingIntent::Reserve => "reserve",
            BookingIntent::CheckOut => "check_out",
            BookingIntent::CheckIn => "check_in",
            BookingIntent::Cancel => "cancel",
            BookingIntent::Archive => "archive",
            BookingIntent::Delete => "delete",
            BookingIntent::ManageAssets { .. } => "manage_assets",
        }
    }
}

/// Role, status and self-service checks, in the order their errors are reported.
fn authorize(actor: &Actor, booking: &BookingState, action: BookingAction) -> Result<(), BookingError> {
    if !can_access(actor, booking) {
        return Err(BookingError::guard(GuardReason::NotYourBooking));
    }
    if !role_permits(actor.role, action) {
        return Err(BookingError::guard(GuardReason::RoleForbidden {
            role: actor.role,
            action,
        }));
    }
    if action == BookingAction::Cancel && booking.status == BookingStatus::Ongoing {
        return Err(BookingError::guard(GuardReason::MustCheckInFirst));
    }
    let flags = BookingFlags::from_status(booking.status);
    if !status_permits(&flags, action) {
        return Err(BookingError::guard(GuardReason::InvalidTransition {
            status: booking.status,
            action,
        }));
    }
    if self_service_restricted(actor.role, &flags, action) {
        return Err(BookingError::guard(GuardReason::SelfServiceReserved));
    }
    Ok(())
}

fn require_admin(actor: &Actor) -> Result<(), BookingError> {
    if can_manage_inventory(actor.role) {
        Ok(())
    } else {
        Err(BookingError::guard(GuardReason::InventoryRequiresAdmin))
    }
}

fn ids_where(assets: &AssetGuards, pred: impl Fn(&AssetState) -> bool) -> Vec<Ulid> {
    assets
        .values()
        .filter(|a| pred(a))
        .map(|a| a.id)
        .collect()
}

fn validate_title(title: &str) -> Result<String, BookingError> {
    validate_name(title).map_err(|e| BookingError::field("title", e.message))
}

impl Engine {
    // ── Assets ───────────────────────────────────────────────

    pub async fn create_asset(&self, id: Ulid, title: String, available_to_book: bool) -> Result<(), BookingError> {
        let _gate = self.commit_gate.read().await;
        let _creating = self.creation.lock().await;
        if self.assets.len() >= MAX_ASSETS_PER_ORGANIZATION {
            return Err(BookingError::LimitExceeded("too many assets"));
        }
        let title = validate_title(&title)?;
        if self.assets.contains_key(&id) {
            return Err(BookingError::AlreadyExists(id));
        }

        let event = Event::AssetCreated {
            id,
            title: title.clone(),
            available_to_book,
        };
        self.wal_append(&event).await?;
        let asset = AssetState::new(id, title, available_to_book);
        self.assets.insert(id, Arc::new(RwLock::new(asset)));
        debug!(asset = %id, "asset created");
        Ok(())
    }

    /// Owner opt-out. Existing reservations are left alone; they surface as
    /// `has_unavailable_assets` until someone acts on them.
    pub async fn set_available_to_book(&self, asset_id: Ulid, available_to_book: bool) -> Result<(), BookingError> {
        let _gate = self.commit_gate.read().await;
        let mut assets = self.lock_assets([asset_id]).await?;
        if assets.get(&asset_id).is_some_and(|a| a.available_to_book == available_to_book) {
            return Ok(());
        }
        let event = Event::AssetAvailabilityChanged {
            id: asset_id,
            available_to_book,
        };
        self.commit(None, &mut assets, &event).await
    }

    /// Hand an asset to someone outside any booking.
    pub async fn assign_custody(&self, actor: &Actor, asset_id: Ulid, custodian: Custodian) -> Result<(), BookingError> {
        require_admin(actor)?;
        let _gate = self.commit_gate.read().await;
        let mut assets = self.lock_assets([asset_id]).await?;
        let free = assets
            .get(&asset_id)
            .is_some_and(|a| a.status == AssetStatus::Available && a.custody.is_none());
        if !free {
            return Err(BookingError::guard_on(GuardReason::AssetNotAvailableForCustody, vec![asset_id]));
        }
        let event = Event::CustodyAssigned {
            asset_id,
            custody_id: Ulid::new(),
            custodian,
            at: now_ms(),
        };
        self.commit(None, &mut assets, &event).await?;
        info!(asset = %asset_id, actor = %actor.user_id, "custody assigned");
        Ok(())
    }

    pub async fn release_custody(&self, actor: &Actor, asset_id: Ulid) -> Result<(), BookingError> {
        require_admin(actor)?;
        let _gate = self.commit_gate.read().await;
        let mut assets = self.lock_assets([asset_id]).await?;
        match assets.get(&asset_id).and_then(|a| a.custody.as_ref()) {
            None => return Err(BookingError::guard_on(GuardReason::NoCustody, vec![asset_id])),
            Some(c) if c.booking_id.is_some() => {
                return Err(BookingError::guard_on(GuardReason::CustodyHeldByBooking, vec![asset_id]));
            }
            Some(_) => {}
        }
        let event = Event::CustodyReleased { asset_id };
        self.commit(None, &mut assets, &event).await?;
        info!(asset = %asset_id, actor = %actor.user_id, "custody released");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Persist a new DRAFT booking and return its id. Self-service callers
    /// are pre-set as the custodian.
    pub async fn create_draft_booking(&self, actor: &Actor, name: Option<String>) -> Result<Ulid, BookingError> {
        let _gate = self.commit_gate.read().await;
        let _creating = self.creation.lock().await;
        if self.bookings.len() >= MAX_BOOKINGS_PER_ORGANIZATION {
            return Err(BookingError::LimitExceeded("too many bookings"));
        }
        let name = match name {
            Some(name) => validate_name(&name).map_err(|e| BookingError::Validation(vec![e]))?,
            None => DEFAULT_DRAFT_NAME.to_string(),
        };
        let custodian = actor
            .role
            .is_self_service()
            .then_some(Custodian::User(actor.user_id));

        let id = Ulid::new();
        let at = now_ms();
        let event = Event::BookingDrafted {
            id,
            name: name.clone(),
            creator_id: actor.user_id,
            custodian,
            at,
        };
        self.wal_append(&event).await?;
        let booking = BookingState::draft(id, name, actor.user_id, custodian, at);
        self.bookings.insert(id, Arc::new(RwLock::new(booking)));
        info!(booking = %id, actor = %actor.user_id, "draft booking created");
        Ok(id)
    }

    /// Run one transition. Guards are evaluated under the same locks that
    /// cover the write; a stale `expected_version` fails with `Conflict`.
    pub async fn apply_intent(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        expected_version: Option<u64>,
        intent: BookingIntent,
    ) -> Result<BookingInfo, BookingError> {
        let label = intent.label();
        let started = Instant::now();

        let result = {
            let _gate = self.commit_gate.read().await;
            self.run_intent(actor, booking_id, expected_version, intent).await
        };

        metrics::histogram!(observability::TRANSITION_DURATION_SECONDS, "transition" => label)
            .record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::TRANSITIONS_TOTAL, "transition" => label, "outcome" => outcome)
            .increment(1);

        match &result {
            Ok(info) => info!(
                booking = %booking_id,
                status = %info.status,
                actor = %actor.user_id,
                "{label} applied"
            ),
            Err(BookingError::WalError(e)) => warn!(booking = %booking_id, "{label} not persisted: {e}"),
            Err(e) => debug!(booking = %booking_id, actor = %actor.user_id, "{label} refused: {e}"),
        }
        result
    }

    async fn run_intent(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        expected_version: Option<u64>,
        intent: BookingIntent,
    ) -> Result<BookingInfo, BookingError> {
        let booking = self.lock_booking(booking_id, expected_version).await?;
        authorize(actor, &booking, intent.action())?;

        match intent {
            BookingIntent::Save { form, hint } => self.save(actor, booking, &form, &hint).await,
            BookingIntent::Reserve => self.reserve(actor, booking).await,
            BookingIntent::CheckOut => self.check_out(actor, booking).await,
            BookingIntent::CheckIn => {
                self.close(actor, booking, Event::BookingCheckedIn { id: booking_id }, NotificationKind::CheckedIn)
                    .await
            }
            BookingIntent::Cancel => {
                self.close(actor, booking, Event::BookingCancelled { id: booking_id }, NotificationKind::Cancelled)
                    .await
            }
            BookingIntent::Archive => {
                self.close(actor, booking, Event::BookingArchived { id: booking_id }, NotificationKind::Archived)
                    .await
            }
            BookingIntent::Delete => self.delete(actor, booking).await,
            BookingIntent::ManageAssets { add, remove } => self.change_assets(booking, add, remove).await,
        }
    }

    /// Commit `event` against the booking and its member assets, then notify.
    async fn finish(
        &self,
        actor: &Actor,
        mut booking: OwnedRwLockWriteGuard<BookingState>,
        mut assets: AssetGuards,
        event: Event,
        kind: NotificationKind,
    ) -> Result<BookingInfo, BookingError> {
        self.commit(Some(&mut booking), &mut assets, &event).await?;
        self.notify
            .send(Notification::new(kind, booking.id, Some(actor.user_id)));
        Ok(booking.info())
    }

    async fn save(
        &self,
        actor: &Actor,
        booking: OwnedRwLockWriteGuard<BookingState>,
        form: &BookingForm,
        hint: &ClientHint,
    ) -> Result<BookingInfo, BookingError> {
        let valid = form
            .validate(actor, hint, now_ms())
            .map_err(BookingError::Validation)?;
        let assets = self.lock_assets(booking.asset_ids.iter().copied()).await?;
        let event = Event::BookingSaved {
            id: booking.id,
            name: valid.name,
            span: valid.span,
            custodian: valid.custodian,
        };
        self.finish(actor, booking, assets, event, NotificationKind::Saved)
            .await
    }

    async fn reserve(&self, actor: &Actor, booking: OwnedRwLockWriteGuard<BookingState>) -> Result<BookingInfo, BookingError> {
        let mut errors = Vec::new();
        match booking.span {
            None => errors.push(FieldError::new("startDate", "Start date is required")),
            Some(span) if span.start <= now_ms() => {
                errors.push(FieldError::new("startDate", "Start date must be in the future"));
            }
            Some(_) => {}
        }
        if booking.custodian.is_none() {
            errors.push(FieldError::new("custodian", "Please select a custodian"));
        }
        let Some(span) = booking.span.filter(|_| errors.is_empty()) else {
            return Err(BookingError::Validation(errors));
        };
        if booking.asset_ids.is_empty() {
            return Err(BookingError::guard(GuardReason::NoAssets));
        }

        let assets = self.lock_assets(booking.asset_ids.iter().copied()).await?;
        let report = evaluate(&span, Some(booking.id), assets.values().map(|a| &**a));
        if report.has_unavailable_assets() {
            return Err(BookingError::guard_on(GuardReason::UnavailableAssets, report.unavailable_ids()));
        }
        if report.has_already_booked_assets() {
            return Err(BookingError::guard_on(
                GuardReason::AlreadyBookedAssets,
                report.already_booked_ids(),
            ));
        }

        let event = Event::BookingReserved { id: booking.id };
        self.finish(actor, booking, assets, event, NotificationKind::Reserved)
            .await
    }

    async fn check_out(&self, actor: &Actor, booking: OwnedRwLockWriteGuard<BookingState>) -> Result<BookingInfo, BookingError> {
        let custodian = booking
            .custodian
            .ok_or_else(|| BookingError::field("custodian", "Please select a custodian"))?;
        if booking.asset_ids.is_empty() {
            return Err(BookingError::guard(GuardReason::NoAssets));
        }

        let assets = self.lock_assets(booking.asset_ids.iter().copied()).await?;
        let id = booking.id;
        let unavailable = ids_where(&assets, |a| !a.available_to_book);
        if !unavailable.is_empty() {
            return Err(BookingError::guard_on(GuardReason::UnavailableAssets, unavailable));
        }
        let checked_out = ids_where(&assets, |a| {
            a.status == AssetStatus::CheckedOut && a.custody_unrelated_to(id)
        });
        if !checked_out.is_empty() {
            return Err(BookingError::guard_on(GuardReason::CheckedOutAssets, checked_out));
        }
        let in_custody = ids_where(&assets, |a| a.custody_unrelated_to(id));
        if !in_custody.is_empty() {
            return Err(BookingError::guard_on(GuardReason::AssetsInCustody, in_custody));
        }

        let event = Event::BookingCheckedOut {
            id: booking.id,
            custodian,
            custodies: assets.keys().map(|id| (*id, Ulid::new())).collect(),
            at: now_ms(),
        };
        self.finish(actor, booking, assets, event, NotificationKind::CheckedOut)
            .await
    }

    /// Check-in, cancel and archive: no guards beyond the permission gate.
    async fn close(
        &self,
        actor: &Actor,
        booking: OwnedRwLockWriteGuard<BookingState>,
        event: Event,
        kind: NotificationKind,
    ) -> Result<BookingInfo, BookingError> {
        let assets = self.lock_assets(booking.asset_ids.iter().copied()).await?;
        self.finish(actor, booking, assets, event, kind).await
    }

    async fn delete(&self, actor: &Actor, mut booking: OwnedRwLockWriteGuard<BookingState>) -> Result<BookingInfo, BookingError> {
        let id = booking.id;
        let mut assets = self.lock_assets(booking.asset_ids.iter().copied()).await?;
        self.commit(Some(&mut booking), &mut assets, &Event::BookingDeleted { id })
            .await?;
        // Unlist before the lock is released so waiters see NotFound.
        self.bookings.remove(&id);
        self.overdue_notified.remove(&id);
        self.notify
            .send(Notification::new(NotificationKind::Deleted, id, Some(actor.user_id)));
        self.notify.remove(&id);
        Ok(booking.info())
    }

    async fn change_assets(
        &self,
        mut booking: OwnedRwLockWriteGuard<BookingState>,
        add: Vec<Ulid>,
        remove: Vec<Ulid>,
    ) -> Result<BookingInfo, BookingError> {
        let Some(span) = booking.span else {
            return Err(BookingError::guard(GuardReason::WindowNotSet));
        };
        let added: BTreeSet<Ulid> = add
            .into_iter()
            .filter(|id| !booking.asset_ids.contains(id))
            .collect();
        let removed: BTreeSet<Ulid> = remove
            .into_iter()
            .filter(|id| booking.asset_ids.contains(id))
            .collect();
        if added.is_empty() && removed.is_empty() {
            return Ok(booking.info());
        }
        if booking.asset_ids.len() + added.len() - removed.len() > MAX_ASSETS_PER_BOOKING {
            return Err(BookingError::LimitExceeded("too many assets in booking"));
        }

        let mut assets = self
            .lock_assets(booking.asset_ids.iter().chain(&added).copied())
            .await?;
        let report = evaluate(&span, Some(booking.id), added.iter().filter_map(|id| assets.get(id)).map(|a| &**a));
        if report.has_unavailable_assets() {
            return Err(BookingError::guard_on(GuardReason::UnavailableAssets, report.unavailable_ids()));
        }
        // A draft may collect contested assets; reserve refuses them later.
        if booking.status == BookingStatus::Reserved && report.has_already_booked_assets() {
            return Err(BookingError::guard_on(
                GuardReason::AlreadyBookedAssets,
                report.already_booked_ids(),
            ));
        }

        let event = Event::BookingAssetsChanged {
            id: booking.id,
            added: added.into_iter().collect(),
            removed: removed.into_iter().collect(),
        };
        self.commit(Some(&mut booking), &mut assets, &event).await?;
        Ok(booking.info())
    }

    // ── Convenience wrappers ─────────────────────────────────

    pub async fn save_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        form: BookingForm,
        hint: &ClientHint,
    ) -> Result<BookingInfo, BookingError> {
        let intent = BookingIntent::Save { form, hint: *hint };
        self.apply_intent(actor, booking_id, None, intent).await
    }

    pub async fn reserve_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<BookingInfo, BookingError> {
        self.apply_intent(actor, booking_id, None, BookingIntent::Reserve).await
    }

    pub async fn check_out_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<BookingInfo, BookingError> {
        self.apply_intent(actor, booking_id, None, BookingIntent::CheckOut).await
    }

    pub async fn check_in_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<BookingInfo, BookingError> {
        self.apply_intent(actor, booking_id, None, BookingIntent::CheckIn).await
    }

    pub async fn cancel_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<BookingInfo, BookingError> {
        self.apply_intent(actor, booking_id, None, BookingIntent::Cancel).await
    }

    pub async fn archive_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<BookingInfo, BookingError> {
        self.apply_intent(actor, booking_id, None, BookingIntent::Archive).await
    }

    pub async fn delete_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<(), BookingError> {
        self.apply_intent(actor, booking_id, None, BookingIntent::Delete)
            .await
            .map(|_| ())
    }

    pub async fn manage_assets(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        add: Vec<Ulid>,
        remove: Vec<Ulid>,
    ) -> Result<BookingInfo, BookingError> {
        self.apply_intent(actor, booking_id, None, BookingIntent::ManageAssets { add, remove })
            .await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::with_capacity(self.assets.len() + self.bookings.len());

        // Assets first: booking snapshots rebuild the join rows on them.
        let assets: Vec<_> = self.assets.iter().map(|e| e.value().clone()).collect();
        for asset in assets {
            events.push(Event::AssetSnapshot(asset.read().await.clone()));
        }
        let bookings: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for booking in bookings {
            events.push(Event::BookingSnapshot(booking.read().await.clone()));
        }

        let count = events.len();
        self.wal_control(|response| WalControl::Compact { events, response })
            .await?
            .map_err(|e| BookingError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_control(|response| WalControl::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}
