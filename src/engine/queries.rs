use std::collections::BTreeSet;

use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::permission::can_access;

use super::availability::{AvailabilityReport, evaluate};
use super::status::{BookingFlags, classify};
use super::{BookingError, Engine, GuardReason};

/// Narrowing for `list_bookings`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub statuses: BTreeSet<BookingStatus>,
    pub custodian: Option<Custodian>,
    /// Only bookings that include this asset.
    pub asset_id: Option<Ulid>,
}

impl BookingFilter {
    pub fn with_statuses(statuses: impl IntoIterator<Item = BookingStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    fn matches(&self, booking: &BookingState) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&booking.status))
            && self.custodian.is_none_or(|c| booking.custodian == Some(c))
            && self.asset_id.is_none_or(|a| booking.asset_ids.contains(&a))
    }
}

impl Engine {
    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<BookingInfo, BookingError> {
        let shared = self.shared_booking(&id).ok_or(BookingError::NotFound(id))?;
        let guard = shared.read().await;
        if !can_access(actor, &guard) {
            return Err(BookingError::guard(GuardReason::NotYourBooking));
        }
        Ok(guard.info())
    }

    /// Derived status of a booking as of `now`. Read locks are taken booking
    /// first, then assets in id order, matching the writers.
    pub async fn booking_flags(&self, id: Ulid, now: Ms) -> Result<BookingFlags, BookingError> {
        let shared = self.shared_booking(&id).ok_or(BookingError::NotFound(id))?;
        let booking = shared.read().await;
        let assets = self.read_assets(booking.asset_ids.iter().copied()).await?;
        Ok(classify(&booking, assets.iter().map(|a| &**a), now))
    }

    /// Bookings visible to `actor`, oldest first. Self-service callers only
    /// see bookings they created or hold.
    pub async fn list_bookings(&self, actor: &Actor, filter: &BookingFilter) -> Vec<BookingInfo> {
        let shared: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for booking in shared {
            let guard = booking.read().await;
            if can_access(actor, &guard) && filter.matches(&guard) {
                out.push(guard.info());
            }
        }
        out.sort_by_key(|b| b.id);
        out
    }

    /// Evaluate `asset_ids` for `window` without changing anything.
    /// `exclude_booking` is the booking being edited, whose own claim is ignored.
    pub async fn check_availability(
        &self,
        window: Span,
        asset_ids: &[Ulid],
        exclude_booking: Option<Ulid>,
    ) -> Result<AvailabilityReport, BookingError> {
        if asset_ids.len() > MAX_ASSETS_PER_BOOKING {
            return Err(BookingError::LimitExceeded("too many assets in query"));
        }
        let assets = self.read_assets(asset_ids.iter().copied()).await?;
        Ok(evaluate(&window, exclude_booking, assets.iter().map(|a| &**a)))
    }

    pub async fn get_asset(&self, id: Ulid) -> Result<AssetInfo, BookingError> {
        let shared = self.shared_asset(&id).ok_or(BookingError::NotFound(id))?;
        let guard = shared.read().await;
        Ok(AssetInfo::from(&*guard))
    }

    pub async fn list_assets(&self) -> Vec<AssetInfo> {
        let shared: Vec<_> = self.assets.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for asset in shared {
            out.push(AssetInfo::from(&*asset.read().await));
        }
        out.sort_by_key(|a| a.id);
        out
    }

    /// Ongoing bookings whose window ended before `now`. Bookings locked by a
    /// writer are skipped; the next scan picks them up.
    pub fn collect_overdue(&self, now: Ms) -> Vec<Ulid> {
        let mut overdue = Vec::new();
        for entry in self.bookings.iter() {
            if let Ok(guard) = entry.value().try_read()
                && guard.status == BookingStatus::Ongoing
                && guard.span.is_some_and(|s| now > s.end)
            {
                overdue.push(guard.id);
            }
        }
        overdue
    }

    async fn read_assets(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<Vec<OwnedRwLockReadGuard<AssetState>>, BookingError> {
        let ids: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut shared = Vec::with_capacity(ids.len());
        for id in ids {
            shared.push(self.shared_asset(&id).ok_or(BookingError::NotFound(id))?);
        }
        let mut guards = Vec::with_capacity(shared.len());
        for asset in shared {
            guards.push(asset.read_owned().await);
        }
        Ok(guards)
    }
}
