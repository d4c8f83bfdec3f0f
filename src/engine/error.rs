use ulid::Ulid;

use crate::form::FieldError;
use crate::model::{BookingStatus, Role};
use crate::permission::BookingAction;

/// Why a transition was refused. The Display text is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardReason {
    #[error("You need to add assets to your booking before you can reserve it")]
    NoAssets,
    #[error("Some assets in this booking are marked as unavailable. Either remove them from this booking or make them available again")]
    UnavailableAssets,
    #[error("Booking has assets that are already booked for the desired period")]
    AlreadyBookedAssets,
    #[error("Some assets in this booking are not available because they are part of an ongoing or overdue booking")]
    CheckedOutAssets,
    #[error("Booking has assets that are currently in custody")]
    AssetsInCustody,
    #[error("You need to select a start and end date and save your booking before you can add assets")]
    WindowNotSet,
    #[error("Cannot {action} a {status} booking")]
    InvalidTransition { status: BookingStatus, action: BookingAction },
    #[error("Ongoing bookings must be checked in before they can be cancelled")]
    MustCheckInFirst,
    #[error("Your role ({role:?}) is not allowed to {action} bookings")]
    RoleForbidden { role: Role, action: BookingAction },
    #[error("You are unable to manage assets because the booking is already reserved. Cancel this booking and create another one if you need to make changes")]
    SelfServiceReserved,
    #[error("You can only act on your own bookings")]
    NotYourBooking,
    #[error("Only owners and administrators can manage inventory")]
    InventoryRequiresAdmin,
    #[error("Asset is not available to be placed in custody")]
    AssetNotAvailableForCustody,
    #[error("Asset is not in custody")]
    NoCustody,
    #[error("Custody was created by a booking; check the booking in instead")]
    CustodyHeldByBooking,
}

/// A failed precondition plus the assets that caused it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct GuardViolation {
    pub reason: GuardReason,
    pub asset_ids: Vec<Ulid>,
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),
    #[error("{0}")]
    Guard(GuardViolation),
    #[error("booking {booking_id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict { booking_id: Ulid, expected: u64, actual: u64 },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BookingError {
    pub fn guard(reason: GuardReason) -> Self {
        BookingError::Guard(GuardViolation {
            reason,
            asset_ids: Vec::new(),
        })
    }

    pub fn guard_on(reason: GuardReason, asset_ids: Vec<Ulid>) -> Self {
        BookingError::Guard(GuardViolation { reason, asset_ids })
    }

    pub fn field(field: &'static str, message: impl Into<String>) -> Self {
        BookingError::Validation(vec![FieldError::new(field, message)])
    }

    /// Only a lost race is worth retrying; everything else needs the caller to change something.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::Conflict { .. })
    }

    pub fn guard_reason(&self) -> Option<&GuardReason> {
        match self {
            BookingError::Guard(v) => Some(&v.reason),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::Guard(_) => "guard",
            BookingError::Conflict { .. } => "conflict",
            BookingError::NotFound(_) => "not_found",
            BookingError::AlreadyExists(_) => "already_exists",
            BookingError::LimitExceeded(_) => "limit",
            BookingError::WalError(_) => "storage",
        }
    }
}
