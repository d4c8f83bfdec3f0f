use serde::Serialize;

use crate::model::*;

use super::availability::evaluate;

/// Logical status of a booking, derived lazily from stored state and `now`.
/// Never cached: recompute for every decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BookingFlags {
    pub is_draft: bool,
    pub is_reserved: bool,
    pub is_ongoing: bool,
    pub is_completed: bool,
    pub is_archived: bool,
    pub is_cancelled: bool,
    /// Checked out and past the window end. A RESERVED booking whose window has
    /// passed without check-out is not overdue.
    pub is_overdue: bool,
    pub has_assets: bool,
    pub has_unavailable_assets: bool,
    pub has_already_booked_assets: bool,
    /// A member asset is CHECKED_OUT under a different booking.
    pub has_checked_out_assets: bool,
    /// A member asset has custody that this booking did not create.
    pub has_assets_in_custody: bool,
}

impl BookingFlags {
    /// Flags that depend only on the stored status.
    pub fn from_status(status: BookingStatus) -> Self {
        Self {
            is_draft: status == BookingStatus::Draft,
            is_reserved: status == BookingStatus::Reserved,
            is_ongoing: status == BookingStatus::Ongoing,
            is_completed: status == BookingStatus::Complete,
            is_archived: status == BookingStatus::Archived,
            is_cancelled: status == BookingStatus::Cancelled,
            ..Self::default()
        }
    }
}

/// Derive the flags for `booking` given its member assets.
pub fn classify<'a>(
    booking: &BookingState,
    assets: impl IntoIterator<Item = &'a AssetState>,
    now: Ms,
) -> BookingFlags {
    let assets: Vec<&AssetState> = assets.into_iter().collect();
    let mut flags = BookingFlags::from_status(booking.status);

    flags.is_overdue = booking.status == BookingStatus::Ongoing
        && booking.span.is_some_and(|s| now > s.end);
    flags.has_assets = !booking.asset_ids.is_empty();

    match booking.span {
        Some(window) => {
            let report = evaluate(&window, Some(booking.id), assets.iter().copied());
            flags.has_unavailable_assets = report.has_unavailable_assets();
            flags.has_already_booked_assets = report.has_already_booked_assets();
        }
        None => {
            flags.has_unavailable_assets = assets.iter().any(|a| !a.available_to_book);
        }
    }

    flags.has_checked_out_assets = assets.iter().any(|a| {
        a.status == AssetStatus::CheckedOut && a.custody_unrelated_to(booking.id)
    });
    flags.has_assets_in_custody = assets.iter().any(|a| a.custody_unrelated_to(booking.id));
    flags
}
