use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{ReservationStatus, Slot, SlotDateTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidInput(String),
    PastDate(SlotDateTime),
    WeekendUnavailable(NaiveDate),
    InvalidSlot(Slot),
    DateBlocked(NaiveDate),
    SlotBlocked(SlotDateTime),
    SlotTaken(Ulid),
    NotFound(Ulid),
    AlreadyTerminal(ReservationStatus),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    LimitExceeded(&'static str),
    /// Store timeout or unavailability. Safe to retry.
    Transient(String),
}

impl EngineError {
    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::PastDate(_) => "past_date",
            EngineError::WeekendUnavailable(_) => "weekend_unavailable",
            EngineError::InvalidSlot(_) => "invalid_slot",
            EngineError::DateBlocked(_) => "date_blocked",
            EngineError::SlotBlocked(_) => "slot_blocked",
            EngineError::SlotTaken(_) => "slot_taken",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyTerminal(_) => "already_terminal",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Transient(_) => "transient",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// The requested time cannot be booked; the client may pick another slot.
    pub fn is_slot_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::PastDate(_)
                | EngineError::WeekendUnavailable(_)
                | EngineError::InvalidSlot(_)
                | EngineError::DateBlocked(_)
                | EngineError::SlotBlocked(_)
                | EngineError::SlotTaken(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::PastDate(at) => write!(f, "{at} is not in the future"),
            EngineError::WeekendUnavailable(d) => {
                write!(f, "{} falls on a weekend; visits run Monday to Friday", d.format("%Y-%m-%d"))
            }
            EngineError::InvalidSlot(s) => write!(f, "{s} is not a bookable slot"),
            EngineError::DateBlocked(d) => write!(f, "{} is unavailable", d.format("%Y-%m-%d")),
            EngineError::SlotBlocked(at) => write!(f, "slot {at} is unavailable"),
            EngineError::SlotTaken(id) => write!(f, "slot already reserved by {id}"),
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyTerminal(st) => write!(f, "reservation is already {st}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move reservation from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Transient(e) => write!(f, "store unavailable, retry: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
