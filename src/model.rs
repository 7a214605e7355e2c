use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minute of the day, `0..=1440`. The only time-of-day type.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open time window `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: Minute,
    pub end: Minute,
}

impl TimeSlot {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "TimeSlot start must be before end");
        debug_assert!(end <= MINUTES_PER_DAY, "TimeSlot must end within the day");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied windows.
    pub fn try_new(start: Minute, end: Minute) -> Option<Self> {
        (start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    /// `TimeSlot::hm(9, 0, 17, 30)` is 09:00-17:30.
    pub fn hm(start_h: u16, start_m: u16, end_h: u16, end_m: u16) -> Self {
        Self::new(start_h * 60 + start_m, end_h * 60 + end_m)
    }

    pub fn duration_minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_slot(&self, other: &TimeSlot) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn start_time(&self) -> NaiveTime {
        minute_to_time(self.start)
    }

    pub fn starts_at(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(self.start))
    }

    /// End instant; a window ending at 24:00 ends at the next midnight.
    pub fn ends_at(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(self.end))
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

fn minute_to_time(m: Minute) -> NaiveTime {
    NaiveTime::from_num_seconds_from_midnight_opt(u32::from(m % MINUTES_PER_DAY) * 60, 0)
        .unwrap_or(NaiveTime::MIN)
}

// ── Identity records ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub surname: String,
    pub gsm: String,
    /// Stored lowercased; unique across users.
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerType {
    Individual,
    Corporate,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: Ulid,
    pub name: String,
    pub surname: String,
    pub gsm: String,
    /// Stored lowercased; unique across owners.
    pub email: String,
    pub owner_type: OwnerType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// External place identifier (e.g. a maps provider id).
    pub place_id: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
    pub id: Ulid,
    pub name: String,
    pub owner_id: Ulid,
    pub location: Location,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Booking policy ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSettings {
    pub id: Ulid,
    /// Unique: one settings record per business.
    pub business_id: Ulid,
    pub slot_duration_minutes: Minute,
    /// Lead time: a slot must start at least this far in the future.
    pub min_advance_minutes: u32,
    /// Booking horizon in days from today.
    pub max_advance_days: u32,
    /// Cancellation is refused this close to the slot start.
    pub cancellation_window_minutes: u32,
    pub accept_reservations: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReservationSettings {
    pub const DEFAULT_SLOT_MINUTES: Minute = 30;
    pub const DEFAULT_MIN_ADVANCE_MINUTES: u32 = 120;
    pub const DEFAULT_MAX_ADVANCE_DAYS: u32 = 30;

    /// Settings used for a business that never stored its own.
    pub fn defaults_for(business_id: Ulid, at: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::nil(),
            business_id,
            slot_duration_minutes: Self::DEFAULT_SLOT_MINUTES,
            min_advance_minutes: Self::DEFAULT_MIN_ADVANCE_MINUTES,
            max_advance_days: Self::DEFAULT_MAX_ADVANCE_DAYS,
            cancellation_window_minutes: 0,
            accept_reservations: true,
            created_at: at,
            updated_at: at,
        }
    }
}

// ── Availability rules ───────────────────────────────────────────

/// Which dates a rule applies to. Variants are ordered by specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityKind {
    RecurringWeekly { day_of_week: Weekday },
    DateRange { start_date: NaiveDate, end_date: NaiveDate },
    SpecificDate { date: NaiveDate },
}

impl AvailabilityKind {
    /// Higher is more specific and wins.
    pub fn specificity(&self) -> u8 {
        match self {
            AvailabilityKind::RecurringWeekly { .. } => 0,
            AvailabilityKind::DateRange { .. } => 1,
            AvailabilityKind::SpecificDate { .. } => 2,
        }
    }

    pub fn applies_to(&self, date: NaiveDate) -> bool {
        match *self {
            AvailabilityKind::RecurringWeekly { day_of_week } => date.weekday() == day_of_week,
            AvailabilityKind::DateRange { start_date, end_date } => {
                start_date <= date && date <= end_date
            }
            AvailabilityKind::SpecificDate { date: d } => d == date,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AvailabilityKind::RecurringWeekly { .. } => "RECURRING_WEEKLY",
            AvailabilityKind::DateRange { .. } => "DATE_RANGE",
            AvailabilityKind::SpecificDate { .. } => "SPECIFIC_DATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub business_id: Ulid,
    pub kind: AvailabilityKind,
    /// `false` marks the applicable dates closed (holiday, vacation).
    pub open: bool,
    /// Open windows; empty when `open` is false.
    pub windows: Vec<TimeSlot>,
    /// Carved out of `windows` (e.g. a lunch break).
    pub blocked: Vec<TimeSlot>,
    /// Tie-breaker among applicable rules of the same kind; higher wins.
    pub priority: i32,
    pub is_active: bool,
    pub block_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied shape of a rule, used for both add and edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDefinition {
    pub kind: AvailabilityKind,
    pub open: bool,
    pub windows: Vec<TimeSlot>,
    pub blocked: Vec<TimeSlot>,
    pub priority: i32,
    pub block_reason: Option<String>,
}

impl RuleDefinition {
    pub fn weekly(day_of_week: Weekday, windows: Vec<TimeSlot>) -> Self {
        Self::open(AvailabilityKind::RecurringWeekly { day_of_week }, windows)
    }

    pub fn open(kind: AvailabilityKind, windows: Vec<TimeSlot>) -> Self {
        Self {
            kind,
            open: true,
            windows,
            blocked: Vec::new(),
            priority: 0,
            block_reason: None,
        }
    }

    pub fn closed(kind: AvailabilityKind, reason: Option<String>) -> Self {
        Self {
            kind,
            open: false,
            windows: Vec::new(),
            blocked: Vec::new(),
            priority: 0,
            block_reason: reason,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 4] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::Completed,
        ReservationStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Confirmed, Completed) | (Pending | Confirmed, Cancelled)
        )
    }

    pub fn is_confirmed(self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::Completed)
    }

    pub fn is_cancelled(self) -> bool {
        self == ReservationStatus::Cancelled
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// The conflict key: at most one non-cancelled reservation per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub business_id: Ulid,
    pub date: NaiveDate,
    pub start: Minute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub business_id: Ulid,
    pub reservation_date: NaiveDate,
    pub time_slot: TimeSlot,
    pub status: ReservationStatus,
    /// Mirrors `status`; never set directly.
    pub is_confirmed: bool,
    /// Mirrors `status`; never set directly.
    pub is_cancelled: bool,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            business_id: self.business_id,
            date: self.reservation_date,
            start: self.time_slot.start,
        }
    }

    /// Set status and keep the derived flags consistent with it.
    pub fn set_status(&mut self, status: ReservationStatus, at: DateTime<Utc>) {
        self.status = status;
        self.is_confirmed = status.is_confirmed();
        self.is_cancelled = status.is_cancelled();
        self.updated_at = at;
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.time_slot.starts_at(self.reservation_date)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.time_slot.ends_at(self.reservation_date)
    }
}

// ── Write inputs ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub surname: String,
    pub gsm: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct NewOwner {
    pub name: String,
    pub surname: String,
    pub gsm: String,
    pub email: String,
    pub owner_type: OwnerType,
}

/// Partial update of mutable contact fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub surname: Option<String>,
    pub gsm: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewBusiness {
    pub name: String,
    pub owner_id: Ulid,
    pub location: Location,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BusinessUpdate {
    pub name: Option<String>,
    pub location: Option<Location>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub slot_duration_minutes: Option<Minute>,
    pub min_advance_minutes: Option<u32>,
    pub max_advance_days: Option<u32>,
    pub cancellation_window_minutes: Option<u32>,
    pub accept_reservations: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub user_id: Ulid,
    pub business_id: Ulid,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub notes: Option<String>,
}

/// Partial reservation change. A new date or slot is a reschedule and is
/// checked like a fresh booking.
#[derive(Debug, Clone, Default)]
pub struct ReservationUpdate {
    pub date: Option<NaiveDate>,
    pub time_slot: Option<TimeSlot>,
    pub notes: Option<String>,
}

// ── WAL record format ────────────────────────────────────────────

/// Every committed mutation. Records carry full rows so replay and
/// compaction are the same apply path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UserCreated(User),
    UserUpdated(User),
    UserDeleted { id: Ulid },
    OwnerCreated(Owner),
    OwnerUpdated(Owner),
    OwnerDeleted { id: Ulid },
    BusinessCreated(Business),
    BusinessUpdated(Business),
    BusinessDeleted { id: Ulid },
    SettingsSaved(ReservationSettings),
    SettingsDeleted { business_id: Ulid },
    RuleAdded(AvailabilityRule),
    RuleUpdated(AvailabilityRule),
    RuleDeactivated { id: Ulid, business_id: Ulid, at: DateTime<Utc> },
    ReservationCreated(Reservation),
    ReservationUpdated(Reservation),
    ReservationStatusChanged {
        id: Ulid,
        business_id: Ulid,
        status: ReservationStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

impl Event {
    /// Business whose subscribers hear about this event, if any.
    pub fn business_id(&self) -> Option<Ulid> {
        match self {
            Event::BusinessCreated(b) | Event::BusinessUpdated(b) => Some(b.id),
            Event::BusinessDeleted { id } => Some(*id),
            Event::SettingsSaved(s) => Some(s.business_id),
            Event::SettingsDeleted { business_id } => Some(*business_id),
            Event::RuleAdded(r) | Event::RuleUpdated(r) => Some(r.business_id),
            Event::RuleDeactivated { business_id, .. } => Some(*business_id),
            Event::ReservationCreated(r) | Event::ReservationUpdated(r) => Some(r.business_id),
            Event::ReservationStatusChanged { business_id, .. } => Some(*business_id),
            Event::UserCreated(_)
            | Event::UserUpdated(_)
            | Event::UserDeleted { .. }
            | Event::OwnerCreated(_)
            | Event::OwnerUpdated(_)
            | Event::OwnerDeleted { .. } => None,
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub user_id: Option<Ulid>,
    pub business_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
    pub is_confirmed: Option<bool>,
    pub is_cancelled: Option<bool>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.user_id.is_none_or(|u| r.user_id == u)
            && self.business_id.is_none_or(|b| r.business_id == b)
            && self.date.is_none_or(|d| r.reservation_date == d)
            && self.status.is_none_or(|s| r.status == s)
            && self.is_confirmed.is_none_or(|c| r.is_confirmed == c)
            && self.is_cancelled.is_none_or(|c| r.is_cancelled == c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    Booked,
    /// Not bookable: carved out by a rule, already started, or inside the
    /// lead-time buffer.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: TimeSlot,
    pub status: SlotStatus,
    pub reservation_id: Option<Ulid>,
    /// Why a `Blocked` slot is blocked.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub slots: Vec<TimeSlot>,
}
