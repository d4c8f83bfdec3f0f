use std::collections::BTreeMap;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

/// Per-asset verdict for a candidate window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AssetAvailability {
    Available,
    /// The owner opted the asset out of bookings.
    MarkedUnavailable,
    /// Claimed by other active bookings whose windows overlap.
    AlreadyBooked { booking_ids: Vec<Ulid> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailabilityReport {
    pub assets: BTreeMap<Ulid, AssetAvailability>,
}

impl AvailabilityReport {
    pub fn has_unavailable_assets(&self) -> bool {
        self.assets
            .values()
            .any(|a| matches!(a, AssetAvailability::MarkedUnavailable))
    }

    pub fn has_already_booked_assets(&self) -> bool {
        self.assets
            .values()
            .any(|a| matches!(a, AssetAvailability::AlreadyBooked { .. }))
    }

    pub fn unavailable_ids(&self) -> Vec<Ulid> {
        self.ids_where(|a| matches!(a, AssetAvailability::MarkedUnavailable))
    }

    pub fn already_booked_ids(&self) -> Vec<Ulid> {
        self.ids_where(|a| matches!(a, AssetAvailability::AlreadyBooked { .. }))
    }

    pub fn get(&self, asset_id: &Ulid) -> Option<&AssetAvailability> {
        self.assets.get(asset_id)
    }

    fn ids_where(&self, pred: impl Fn(&AssetAvailability) -> bool) -> Vec<Ulid> {
        self.assets
            .iter()
            .filter(|(_, a)| pred(a))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Classify one asset for `window`, ignoring the claim of `editing` (the booking being edited).
pub fn classify_asset(asset: &AssetState, window: &Span, editing: Option<Ulid>) -> AssetAvailability {
    if !asset.available_to_book {
        return AssetAvailability::MarkedUnavailable;
    }
    let booking_ids: Vec<Ulid> = asset
        .overlapping(window)
        .filter(|b| b.status.claims_assets() && Some(b.booking_id) != editing)
        .map(|b| b.booking_id)
        .collect();
    if booking_ids.is_empty() {
        AssetAvailability::Available
    } else {
        AssetAvailability::AlreadyBooked { booking_ids }
    }
}

/// Evaluate a candidate asset set. The result is keyed by asset id, so it does
/// not depend on the order the assets are supplied in.
pub fn evaluate<'a>(
    window: &Span,
    editing: Option<Ulid>,
    assets: impl IntoIterator<Item = &'a AssetState>,
) -> AvailabilityReport {
    let assets = assets
        .into_iter()
        .map(|a| (a.id, classify_asset(a, window, editing)))
        .collect();
    AvailabilityReport { assets }
}
