//! The daily slot grid and the canonical business time zone.
//!
//! Every weekday and time-of-day computation in the crate goes through
//! [`SlotCalendar`], so a single instant can never be read in two offsets.

use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc, Weekday};

use crate::model::{Ms, Slot, SlotDateTime};

/// 09:00…17:00 hourly with a midday gap.
pub const DEFAULT_SLOTS: [(u32, u32); 8] = [
    (9, 0),
    (10, 0),
    (11, 0),
    (12, 0),
    (14, 0),
    (15, 0),
    (16, 0),
    (17, 0),
];

#[derive(Debug, Clone)]
pub struct SlotCalendar {
    slots: Vec<Slot>,
    offset: FixedOffset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    EmptyGrid,
    DuplicateSlot(Slot),
    BadOffset(i32),
}

impl fmt::Display for CalendarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarError::EmptyGrid => write!(f, "slot grid is empty"),
            CalendarError::DuplicateSlot(s) => write!(f, "slot {s} listed twice"),
            CalendarError::BadOffset(m) => write!(f, "UTC offset of {m} minutes is out of range"),
        }
    }
}

impl std::error::Error for CalendarError {}

impl Default for SlotCalendar {
    fn default() -> Self {
        let slots = DEFAULT_SLOTS
            .iter()
            .filter_map(|&(h, m)| Slot::new(h, m))
            .collect();
        Self {
            slots,
            offset: Utc.fix(),
        }
    }
}

impl SlotCalendar {
    /// Build a calendar from an arbitrary grid; slots are sorted ascending.
    pub fn new(mut slots: Vec<Slot>, utc_offset_minutes: i32) -> Result<Self, CalendarError> {
        if slots.is_empty() {
            return Err(CalendarError::EmptyGrid);
        }
        slots.sort();
        if let Some(w) = slots.windows(2).find(|w| w[0] == w[1]) {
            return Err(CalendarError::DuplicateSlot(w[0]));
        }
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or(CalendarError::BadOffset(utc_offset_minutes))?;
        Ok(Self { slots, offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn grid(&self) -> &[Slot] {
        &self.slots
    }

    pub fn is_weekend(&self, date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// The bookable slots of `date`, ascending. Empty on weekends.
    pub fn slots_for_day(&self, date: NaiveDate) -> &[Slot] {
        if self.is_weekend(date) {
            &[]
        } else {
            &self.slots
        }
    }

    pub fn contains(&self, date: NaiveDate, slot: Slot) -> bool {
        self.slots_for_day(date).binary_search(&slot).is_ok()
    }

    /// Whether `slot` is part of the grid at all, regardless of weekday.
    pub fn is_grid_slot(&self, slot: Slot) -> bool {
        self.slots.binary_search(&slot).is_ok()
    }

    /// Wall-clock time in the business zone at unix-ms instant `now`.
    pub fn local_now(&self, now: Ms) -> NaiveDateTime {
        DateTime::<Utc>::from_timestamp_millis(now)
            .unwrap_or_default()
            .with_timezone(&self.offset)
            .naive_local()
    }

    pub fn today(&self, now: Ms) -> NaiveDate {
        self.local_now(now).date()
    }

    /// Unix-ms instant at which `at` begins.
    pub fn instant_of(&self, at: &SlotDateTime) -> Ms {
        at.naive()
            .and_local_timezone(self.offset)
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| at.naive().and_utc().timestamp_millis())
    }

    /// True when `at` is at or before `now`.
    pub fn is_past(&self, at: &SlotDateTime, now: Ms) -> bool {
        at.naive() <= self.local_now(now)
    }
}
