use serde::Serialize;

use crate::engine::BookingFlags;
use crate::model::{Actor, BookingState, Role};

/// Everything a caller can try to do to a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BookingAction {
    View,
    Save,
    Reserve,
    CheckOut,
    CheckIn,
    Cancel,
    Archive,
    Delete,
    ManageAssets,
}

impl BookingAction {
    pub fn label(self) -> &'static str {
        match self {
            BookingAction::View => "view",
            BookingAction::Save => "save",
            BookingAction::Reserve => "reserve",
            BookingAction::CheckOut => "check-out",
            BookingAction::CheckIn => "check-in",
            BookingAction::Cancel => "cancel",
            BookingAction::Archive => "archive",
            BookingAction::Delete => "delete",
            BookingAction::ManageAssets => "manage assets of",
        }
    }
}

impl std::fmt::Display for BookingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Role-only part of the gate.
pub fn role_permits(role: Role, action: BookingAction) -> bool {
    match role {
        Role::Owner | Role::Admin => true,
        Role::SelfService => !matches!(
            action,
            BookingAction::CheckOut | BookingAction::CheckIn | BookingAction::Archive
        ),
    }
}

/// Status-only part of the gate: is `action` a legal move from the current state?
pub fn status_permits(flags: &BookingFlags, action: BookingAction) -> bool {
    match action {
        BookingAction::View => true,
        BookingAction::Save | BookingAction::Reserve | BookingAction::Delete => flags.is_draft,
        BookingAction::CheckOut => flags.is_reserved,
        BookingAction::CheckIn => flags.is_ongoing || flags.is_overdue,
        BookingAction::Cancel | BookingAction::ManageAssets => flags.is_draft || flags.is_reserved,
        BookingAction::Archive => flags.is_completed || flags.is_cancelled,
    }
}

/// Self-service users lose asset management once a booking leaves DRAFT.
pub fn self_service_restricted(role: Role, flags: &BookingFlags, action: BookingAction) -> bool {
    role.is_self_service() && action == BookingAction::ManageAssets && !flags.is_draft
}

/// Whether `role` may perform `action` on a booking in the state described by `flags`.
///
/// UI affordances call this too, but the engine re-checks it on every transition.
pub fn can_perform(role: Role, flags: &BookingFlags, action: BookingAction) -> bool {
    role_permits(role, action)
        && status_permits(flags, action)
        && !self_service_restricted(role, flags, action)
}

/// Self-service users only see bookings they created or hold custody of.
pub fn can_access(actor: &Actor, booking: &BookingState) -> bool {
    !actor.role.is_self_service() || booking.involves_user(actor.user_id)
}

/// Creating assets, toggling bookability and direct custody.
pub fn can_manage_inventory(role: Role) -> bool {
    matches!(role, Role::Owner | Role::Admin)
}
