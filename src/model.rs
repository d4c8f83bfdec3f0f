use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Half-open overlap test on raw bounds. Callers guarantee `start < end` on both sides.
///
/// Windows that merely touch (`end_a == start_b`) do not overlap, which is what
/// allows back-to-back bookings of the same asset.
pub fn windows_overlap(start_a: Ms, end_a: Ms, start_b: Ms, end_b: Ms) -> bool {
    start_a < end_b && start_b < end_a
}

/// Half-open booking window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        windows_overlap(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Persisted booking status. OVERDUE is never stored; see `BookingFlags::is_overdue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookingStatus {
    Draft,
    Reserved,
    Ongoing,
    Complete,
    Archived,
    Cancelled,
}

impl BookingStatus {
    /// No lifecycle transition leaves these, except the archive cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Complete | BookingStatus::Archived | BookingStatus::Cancelled)
    }

    /// Statuses whose window blocks other bookings from claiming the same asset.
    pub fn claims_assets(self) -> bool {
        matches!(self, BookingStatus::Reserved | BookingStatus::Ongoing)
    }

    pub fn label(self) -> &'static str {
        match self {
            BookingStatus::Draft => "DRAFT",
            BookingStatus::Reserved => "RESERVED",
            BookingStatus::Ongoing => "ONGOING",
            BookingStatus::Complete => "COMPLETE",
            BookingStatus::Archived => "ARCHIVED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetStatus {
    Available,
    InCustody,
    CheckedOut,
}

/// Role of the caller inside the organization that owns the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Admin,
    SelfService,
}

impl Role {
    pub fn is_self_service(self) -> bool {
        matches!(self, Role::SelfService)
    }
}

/// Who holds the assets: a registered user or a team member without a login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Custodian {
    User(Ulid),
    TeamMember(Ulid),
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Ulid, role: Role) -> Self {
        Self { user_id, role }
    }
}

/// "Asset X is currently with custodian Y".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Custody {
    pub id: Ulid,
    pub custodian: Custodian,
    /// Set when the custody was created by a booking check-out.
    pub booking_id: Option<Ulid>,
    /// Asset status to restore once the custody is released.
    pub previous_status: AssetStatus,
    pub since: Ms,
}

/// One row of the asset ↔ booking join, denormalized onto the asset so that
/// availability can be evaluated while holding only the asset's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBooking {
    pub booking_id: Ulid,
    pub span: Option<Span>,
    pub status: BookingStatus,
}

impl AssetBooking {
    fn sort_key(&self) -> Ms {
        self.span.map_or(Ms::MIN, |s| s.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetState {
    pub id: Ulid,
    pub title: String,
    pub status: AssetStatus,
    /// Owner opt-out, independent of booking state.
    pub available_to_book: bool,
    pub custody: Option<Custody>,
    /// Bookings that include this asset, sorted by window start (unscheduled first).
    /// Rebuilt from the bookings on replay, never written to the log.
    #[serde(skip)]
    pub bookings: Vec<AssetBooking>,
}

impl AssetState {
    pub fn new(id: Ulid, title: String, available_to_book: bool) -> Self {
        Self {
            id,
            title,
            status: AssetStatus::Available,
            available_to_book,
            custody: None,
            bookings: Vec::new(),
        }
    }

    /// Insert a join row keeping the sort order by window start.
    pub fn insert_booking(&mut self, row: AssetBooking) {
        self.remove_booking(row.booking_id);
        let key = row.sort_key();
        let pos = self.bookings.partition_point(|b| b.sort_key() <= key);
        self.bookings.insert(pos, row);
    }

    pub fn remove_booking(&mut self, booking_id: Ulid) -> Option<AssetBooking> {
        let pos = self.bookings.iter().position(|b| b.booking_id == booking_id)?;
        Some(self.bookings.remove(pos))
    }

    /// Refresh the denormalized window/status of a booking that includes this asset.
    pub fn update_booking(&mut self, booking_id: Ulid, span: Option<Span>, status: BookingStatus) {
        let moved = self
            .bookings
            .iter()
            .find(|b| b.booking_id == booking_id)
            .is_some_and(|b| b.span != span);
        if moved {
            self.insert_booking(AssetBooking { booking_id, span, status });
        } else if let Some(row) = self.bookings.iter_mut().find(|b| b.booking_id == booking_id) {
            row.status = status;
        }
    }

    /// Join rows whose window overlaps `query`. Unscheduled rows never overlap.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &AssetBooking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.bookings.partition_point(|b| b.sort_key() < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.is_some_and(|s| s.overlaps(query)))
    }

    /// Custody created by some booking other than `booking_id`, or assigned directly.
    pub fn custody_unrelated_to(&self, booking_id: Ulid) -> bool {
        self.custody
            .as_ref()
            .is_some_and(|c| c.booking_id != Some(booking_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingState {
    pub id: Ulid,
    pub name: String,
    pub status: BookingStatus,
    pub span: Option<Span>,
    pub creator_id: Ulid,
    pub custodian: Option<Custodian>,
    pub asset_ids: BTreeSet<Ulid>,
    pub created_at: Ms,
    /// Bumped by every applied event; used for optimistic concurrency checks.
    pub version: u64,
}

impl BookingState {
    pub fn draft(id: Ulid, name: String, creator_id: Ulid, custodian: Option<Custodian>, created_at: Ms) -> Self {
        Self {
            id,
            name,
            status: BookingStatus::Draft,
            span: None,
            creator_id,
            custodian,
            asset_ids: BTreeSet::new(),
            created_at,
            version: 0,
        }
    }

    pub fn join_row(&self) -> AssetBooking {
        AssetBooking {
            booking_id: self.id,
            span: self.span,
            status: self.status,
        }
    }

    pub fn involves_user(&self, user_id: Ulid) -> bool {
        self.creator_id == user_id || self.custodian == Some(Custodian::User(user_id))
    }

    pub fn info(&self) -> BookingInfo {
        BookingInfo {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            from: self.span.map(|s| s.start),
            to: self.span.map(|s| s.end),
            creator_id: self.creator_id,
            custodian: self.custodian,
            asset_ids: self.asset_ids.iter().copied().collect(),
            version: self.version,
        }
    }
}

/// The event types, i.e. the WAL record format. Every booking transition is
/// exactly one record, so a transition is either fully replayed or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AssetCreated {
        id: Ulid,
        title: String,
        available_to_book: bool,
    },
    AssetAvailabilityChanged {
        id: Ulid,
        available_to_book: bool,
    },
    CustodyAssigned {
        asset_id: Ulid,
        custody_id: Ulid,
        custodian: Custodian,
        at: Ms,
    },
    CustodyReleased {
        asset_id: Ulid,
    },
    BookingDrafted {
        id: Ulid,
        name: String,
        creator_id: Ulid,
        custodian: Option<Custodian>,
        at: Ms,
    },
    BookingSaved {
        id: Ulid,
        name: String,
        span: Span,
        custodian: Custodian,
    },
    BookingAssetsChanged {
        id: Ulid,
        added: Vec<Ulid>,
        removed: Vec<Ulid>,
    },
    BookingReserved {
        id: Ulid,
    },
    BookingCheckedOut {
        id: Ulid,
        custodian: Custodian,
        /// `(asset_id, custody_id)` per member asset.
        custodies: Vec<(Ulid, Ulid)>,
        at: Ms,
    },
    BookingCheckedIn {
        id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
    },
    BookingArchived {
        id: Ulid,
    },
    BookingDeleted {
        id: Ulid,
    },
    /// Compaction records: full state of one asset / booking.
    AssetSnapshot(AssetState),
    BookingSnapshot(BookingState),
}

impl Event {
    /// The booking an event mutates, if any.
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingDrafted { id, .. }
            | Event::BookingSaved { id, .. }
            | Event::BookingAssetsChanged { id, .. }
            | Event::BookingReserved { id }
            | Event::BookingCheckedOut { id, .. }
            | Event::BookingCheckedIn { id }
            | Event::BookingCancelled { id }
            | Event::BookingArchived { id }
            | Event::BookingDeleted { id } => Some(*id),
            Event::BookingSnapshot(b) => Some(b.id),
            Event::AssetCreated { .. }
            | Event::AssetAvailabilityChanged { .. }
            | Event::CustodyAssigned { .. }
            | Event::CustodyReleased { .. }
            | Event::AssetSnapshot(_) => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub name: String,
    pub status: BookingStatus,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
    pub creator_id: Ulid,
    pub custodian: Option<Custodian>,
    pub asset_ids: Vec<Ulid>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetInfo {
    pub id: Ulid,
    pub title: String,
    pub status: AssetStatus,
    pub available_to_book: bool,
    pub custodian: Option<Custodian>,
    pub booking_ids: Vec<Ulid>,
}

impl From<&AssetState> for AssetInfo {
    fn from(a: &AssetState) -> Self {
        Self {
            id: a.id,
            title: a.title.clone(),
            status: a.status,
            available_to_book: a.available_to_book,
            custodian: a.custody.as_ref().map(|c| c.custodian),
            booking_ids: a.bookings.iter().map(|b| b.booking_id).collect(),
        }
    }
}
