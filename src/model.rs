use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for `now` and audit timestamps.
pub type Ms = i64;

/// Opaque key of an externally-owned property record.
pub type PropertyId = String;

/// Opaque identity of the staff account performing an action.
pub type ActorId = String;

/// One bookable time-of-day from the daily grid, minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    minutes: u16,
}

impl Slot {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: (hour * 60 + minute) as u16,
        })
    }

    /// Slot for a time of day; `None` unless it sits exactly on a minute.
    pub fn from_time(time: NaiveTime) -> Option<Self> {
        if time.second() != 0 || time.nanosecond() != 0 {
            return None;
        }
        Self::new(time.hour(), time.minute())
    }

    pub fn hour(&self) -> u32 {
        u32::from(self.minutes / 60)
    }

    pub fn minute(&self) -> u32 {
        u32::from(self.minutes % 60)
    }

    pub fn minutes_of_day(&self) -> u16 {
        self.minutes
    }

    pub fn to_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSlotError(pub String);

impl fmt::Display for ParseSlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid slot '{}': expected HH:MM", self.0)
    }
}

impl std::error::Error for ParseSlotError {}

impl FromStr for Slot {
    type Err = ParseSlotError;

    /// Accepts `H:MM`, `HH:MM`, and `HH:MM:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let time = NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map_err(|_| ParseSlotError(s.to_string()))?;
        Self::from_time(time).ok_or_else(|| ParseSlotError(s.to_string()))
    }
}

/// A calendar date plus a slot, in the canonical business time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotDateTime {
    pub date: NaiveDate,
    pub slot: Slot,
}

impl SlotDateTime {
    pub fn new(date: NaiveDate, slot: Slot) -> Self {
        Self { date, slot }
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.date.and_time(self.slot.to_time())
    }
}

impl fmt::Display for SlotDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date.format("%Y-%m-%d"), self.slot)
    }
}

/// Informational only; never affects scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VisitKind {
    SaleVisit,
    RentalVisit,
}

impl VisitKind {
    pub const ALL: [VisitKind; 2] = [VisitKind::SaleVisit, VisitKind::RentalVisit];

    pub fn as_str(&self) -> &'static str {
        match self {
            VisitKind::SaleVisit => "sale",
            VisitKind::RentalVisit => "rental",
        }
    }
}

impl FromStr for VisitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sale" | "sale_visit" => Ok(VisitKind::SaleVisit),
            "rental" | "rental_visit" => Ok(VisitKind::RentalVisit),
            other => Err(format!("unknown visit kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
    Completed,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 5] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::Cancelled,
        ReservationStatus::Expired,
        ReservationStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Completed => "completed",
        }
    }

    /// Active reservations occupy their slot.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReservationStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown reservation status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub property_id: PropertyId,
    pub client: ClientInfo,
    pub kind: VisitKind,
    pub slot: SlotDateTime,
    pub status: ReservationStatus,
    /// Absent for publicly-submitted requests.
    pub owner_id: Option<ActorId>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Caller-supplied part of a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub property_id: PropertyId,
    pub slot: SlotDateTime,
    pub client: ClientInfo,
    pub kind: VisitKind,
    pub notes: Option<String>,
}

/// Partial update of the informational fields. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Amendment {
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub kind: Option<VisitKind>,
    pub notes: Option<String>,
}

impl Amendment {
    pub fn is_empty(&self) -> bool {
        self.client_name.is_none()
            && self.client_email.is_none()
            && self.client_phone.is_none()
            && self.kind.is_none()
            && self.notes.is_none()
    }
}

/// Blackouts are keyed by date plus an optional slot; `None` blocks the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlackoutKey {
    pub date: NaiveDate,
    pub slot: Option<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutEntry {
    pub date: NaiveDate,
    pub slot: Option<Slot>,
    pub reason: Option<String>,
    pub created_at: Ms,
}

impl BlackoutEntry {
    pub fn key(&self) -> BlackoutKey {
        BlackoutKey {
            date: self.date,
            slot: self.slot,
        }
    }

    pub fn is_whole_day(&self) -> bool {
        self.slot.is_none()
    }
}

/// Why a (date, slot) is blacked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Day,
    Slot,
}

/// All reservations of one property, sorted by slot.
#[derive(Debug, Clone)]
pub struct PropertyState {
    pub property_id: PropertyId,
    pub reservations: Vec<Reservation>,
}

impl PropertyState {
    pub fn new(property_id: PropertyId) -> Self {
        Self {
            property_id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by slot. Replaces an existing entry with the same id.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        self.remove_reservation(reservation.id);
        let pos = self
            .reservations
            .partition_point(|r| r.slot <= reservation.slot);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Every reservation (any status) at exactly `slot`.
    pub fn at(&self, slot: &SlotDateTime) -> impl Iterator<Item = &Reservation> {
        let lo = self.reservations.partition_point(|r| r.slot < *slot);
        let hi = self.reservations.partition_point(|r| r.slot <= *slot);
        self.reservations[lo..hi].iter()
    }

    /// Every reservation (any status) on `date`.
    pub fn on_date(&self, date: NaiveDate) -> impl Iterator<Item = &Reservation> {
        let lo = self.reservations.partition_point(|r| r.slot.date < date);
        let hi = self.reservations.partition_point(|r| r.slot.date <= date);
        self.reservations[lo..hi].iter()
    }

    /// The active reservation holding `slot`, ignoring `exclude`.
    pub fn active_at(&self, slot: &SlotDateTime, exclude: Option<Ulid>) -> Option<&Reservation> {
        self.at(slot)
            .find(|r| r.is_active() && Some(r.id) != exclude)
    }
}

/// Criteria for listing reservations. Every set field must match; dates are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub status: Option<ReservationStatus>,
    pub kind: Option<VisitKind>,
    pub property_id: Option<PropertyId>,
    pub owner_id: Option<ActorId>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.status.is_none_or(|s| r.status == s)
            && self.kind.is_none_or(|k| r.kind == k)
            && self
                .property_id
                .as_ref()
                .is_none_or(|p| &r.property_id == p)
            && self
                .owner_id
                .as_ref()
                .is_none_or(|o| r.owner_id.as_ref() == Some(o))
            && self.from.is_none_or(|d| r.slot.date >= d)
            && self.to.is_none_or(|d| r.slot.date <= d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub total: usize,
    pub by_status: BTreeMap<ReservationStatus, usize>,
    pub by_kind: BTreeMap<VisitKind, usize>,
}

impl Statistics {
    pub fn empty() -> Self {
        Self {
            total: 0,
            by_status: ReservationStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
            by_kind: VisitKind::ALL.into_iter().map(|k| (k, 0)).collect(),
        }
    }

    pub fn record(&mut self, r: &Reservation) {
        self.total += 1;
        *self.by_status.entry(r.status).or_default() += 1;
        *self.by_kind.entry(r.kind).or_default() += 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub completed: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.expired == 0 && self.completed == 0
    }
}

/// Events persisted to the WAL, one per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationRescheduled {
        id: Ulid,
        property_id: PropertyId,
        slot: SlotDateTime,
        updated_at: Ms,
    },
    ReservationStatusChanged {
        id: Ulid,
        property_id: PropertyId,
        status: ReservationStatus,
        updated_at: Ms,
    },
    /// One sweep batch for one property: every id moves to the given status.
    ReservationsSwept {
        property_id: PropertyId,
        ids: Vec<Ulid>,
        status: ReservationStatus,
        updated_at: Ms,
    },
    ReservationAmended {
        id: Ulid,
        property_id: PropertyId,
        client: ClientInfo,
        kind: VisitKind,
        notes: Option<String>,
        updated_at: Ms,
    },
    ReservationRemoved {
        id: Ulid,
        property_id: PropertyId,
    },
    BlackoutAdded {
        entry: BlackoutEntry,
    },
    BlackoutRemoved {
        key: BlackoutKey,
    },
}

impl Event {
    /// The property a reservation event belongs to; `None` for blackout events.
    pub fn property_id(&self) -> Option<&PropertyId> {
        match self {
            Event::ReservationCreated { reservation } => Some(&reservation.property_id),
            Event::ReservationRescheduled { property_id, .. }
            | Event::ReservationStatusChanged { property_id, .. }
            | Event::ReservationsSwept { property_id, .. }
            | Event::ReservationAmended { property_id, .. }
            | Event::ReservationRemoved { property_id, .. } => Some(property_id),
            Event::BlackoutAdded { .. } | Event::BlackoutRemoved { .. } => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn slot_parse_and_display() {
        let s: Slot = "09:00".parse().unwrap();
        assert_eq!(s, slot(9, 0));
        assert_eq!(s.to_string(), "09:00");
        assert_eq!("9:30".parse::<Slot>().unwrap(), slot(9, 30));
        assert_eq!("14:00:00".parse::<Slot>().unwrap(), slot(14, 0));
        assert!("24:00".parse::<Slot>().is_err());
        assert!("14:00:30".parse::<Slot>().is_err());
        assert!("noon".parse::<Slot>().is_err());
    }

    #[test]
    fn slot_ordering_follows_time_of_day() {
        assert!(slot(9, 0) < slot(10, 0));
        assert!(slot(12, 0) < slot(14, 0));
        assert_eq!(slot(17, 0).minutes_of_day(), 17 * 60);
    }

    #[test]
    fn slot_from_time_rejects_seconds() {
        let t = NaiveTime::from_hms_opt(9, 0, 1).unwrap();
        assert!(Slot::from_time(t).is_none());
        let t = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert_eq!(Slot::from_time(t), Some(slot(9, 0)));
    }

    #[test]
    fn slot_datetime_orders_by_date_then_slot() {
        let a = SlotDateTime::new(date(2025, 10, 13), slot(17, 0));
        let b = SlotDateTime::new(date(2025, 10, 14), slot(9, 0));
        assert!(a < b);
        assert_eq!(a.to_string(), "2025-10-13 17:00");
    }

    #[test]
    fn status_helpers() {
        assert!(ReservationStatus::Pending.is_active());
        assert!(ReservationStatus::Confirmed.is_active());
        for st in [
            ReservationStatus::Cancelled,
            ReservationStatus::Expired,
            ReservationStatus::Completed,
        ] {
            assert!(st.is_terminal());
        }
        assert_eq!("CONFIRMED".parse::<ReservationStatus>().unwrap(), ReservationStatus::Confirmed);
        assert!("booked".parse::<ReservationStatus>().is_err());
    }

    #[test]
    fn visit_kind_parse() {
        assert_eq!("sale".parse::<VisitKind>().unwrap(), VisitKind::SaleVisit);
        assert_eq!("Rental".parse::<VisitKind>().unwrap(), VisitKind::RentalVisit);
        assert!("lease".parse::<VisitKind>().is_err());
    }

    #[test]
    fn property_state_keeps_slot_order() {
        let mut ps = PropertyState::new("p1".into());
        let d = date(2025, 10, 13);
        ps.insert_reservation(reservation("p1", SlotDateTime::new(d, slot(15, 0)), ReservationStatus::Pending));
        ps.insert_reservation(reservation("p1", SlotDateTime::new(d, slot(9, 0)), ReservationStatus::Pending));
        ps.insert_reservation(reservation("p1", SlotDateTime::new(d, slot(11, 0)), ReservationStatus::Pending));
        let slots: Vec<_> = ps.reservations.iter().map(|r| r.slot.slot).collect();
        assert_eq!(slots, vec![slot(9, 0), slot(11, 0), slot(15, 0)]);
    }

    #[test]
    fn property_state_insert_replaces_same_id() {
        let mut ps = PropertyState::new("p1".into());
        let mut r = reservation("p1", SlotDateTime::new(date(2025, 10, 13), slot(9, 0)), ReservationStatus::Pending);
        ps.insert_reservation(r.clone());
        r.slot.slot = slot(10, 0);
        ps.insert_reservation(r.clone());
        assert_eq!(ps.reservations.len(), 1);
        assert_eq!(ps.reservations[0].slot.slot, slot(10, 0));
    }

    #[test]
    fn active_at_ignores_terminal_and_excluded() {
        let mut ps = PropertyState::new("p1".into());
        let at = SlotDateTime::new(date(2025, 10, 13), slot(9, 0));
        ps.insert_reservation(reservation("p1", at, ReservationStatus::Cancelled));
        ps.insert_reservation(reservation("p1", at, ReservationStatus::Expired));
        assert!(ps.active_at(&at, None).is_none());

        let live = reservation("p1", at, ReservationStatus::Confirmed);
        let live_id = live.id;
        ps.insert_reservation(live);
        assert_eq!(ps.active_at(&at, None).map(|r| r.id), Some(live_id));
        assert!(ps.active_at(&at, Some(live_id)).is_none());
        assert_eq!(ps.at(&at).count(), 3);
    }

    #[test]
    fn on_date_bounds() {
        let mut ps = PropertyState::new("p1".into());
        for d in [12, 13, 13, 14] {
            ps.insert_reservation(reservation(
                "p1",
                SlotDateTime::new(date(2025, 10, d), slot(9, 0)),
                ReservationStatus::Pending,
            ));
        }
        assert_eq!(ps.on_date(date(2025, 10, 13)).count(), 2);
        assert_eq!(ps.on_date(date(2025, 10, 20)).count(), 0);
    }

    #[test]
    fn filter_matches_every_set_field() {
        let at = SlotDateTime::new(date(2025, 10, 13), slot(9, 0));
        let mut r = reservation("p1", at, ReservationStatus::Pending);
        r.owner_id = Some("agent-7".into());

        assert!(ReservationFilter::default().matches(&r));
        let f = ReservationFilter {
            status: Some(ReservationStatus::Pending),
            property_id: Some("p1".into()),
            owner_id: Some("agent-7".into()),
            from: Some(date(2025, 10, 13)),
            to: Some(date(2025, 10, 13)),
            ..Default::default()
        };
        assert!(f.matches(&r));
        let wrong_kind = ReservationFilter {
            kind: Some(VisitKind::RentalVisit),
            ..Default::default()
        };
        assert!(!wrong_kind.matches(&r));
        let too_late = ReservationFilter {
            from: Some(date(2025, 10, 14)),
            ..Default::default()
        };
        assert!(!too_late.matches(&r));
    }

    #[test]
    fn statistics_report_every_variant() {
        let mut stats = Statistics::empty();
        let at = SlotDateTime::new(date(2025, 10, 13), slot(9, 0));
        stats.record(&reservation("p1", at, ReservationStatus::Pending));
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_status.len(), 5);
        assert_eq!(stats.by_status[&ReservationStatus::Pending], 1);
        assert_eq!(stats.by_status[&ReservationStatus::Expired], 0);
        assert_eq!(stats.by_kind[&VisitKind::SaleVisit], 1);
        assert_eq!(stats.by_kind[&VisitKind::RentalVisit], 0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let at = SlotDateTime::new(date(2025, 10, 13), slot(9, 0));
        let event = Event::ReservationCreated {
            reservation: reservation("p1", at, ReservationStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
