use ulid::Ulid;

use crate::calendar::SlotCalendar;
use crate::limits::*;
use crate::model::*;

use super::blackout::BlackoutRegistry;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Outcome of checking one (property, date, slot) against the calendar,
/// blackouts, and existing reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotVerdict {
    Free,
    Past,
    Weekend,
    InvalidSlot,
    DayBlocked,
    SlotBlocked,
    Taken(Ulid),
}

impl SlotVerdict {
    pub fn is_free(&self) -> bool {
        matches!(self, SlotVerdict::Free)
    }

    pub fn into_result(self, at: &SlotDateTime) -> Result<(), EngineError> {
        match self {
            SlotVerdict::Free => Ok(()),
            SlotVerdict::Past => Err(EngineError::PastDate(*at)),
            SlotVerdict::Weekend => Err(EngineError::WeekendUnavailable(at.date)),
            SlotVerdict::InvalidSlot => Err(EngineError::InvalidSlot(at.slot)),
            SlotVerdict::DayBlocked => Err(EngineError::DateBlocked(at.date)),
            SlotVerdict::SlotBlocked => Err(EngineError::SlotBlocked(*at)),
            SlotVerdict::Taken(id) => Err(EngineError::SlotTaken(id)),
        }
    }
}

/// The single bookability predicate. Booking and availability both go
/// through here, so a slot listed as free is one a booking would accept.
///
/// Checks run in a fixed order and the first failure wins: past, weekend,
/// off-grid, whole-day blackout, slot blackout, held by an active reservation.
pub(crate) fn check_slot(
    calendar: &SlotCalendar,
    blackouts: &BlackoutRegistry,
    property: Option<&PropertyState>,
    at: &SlotDateTime,
    now: Ms,
    exclude: Option<Ulid>,
) -> SlotVerdict {
    if calendar.is_past(at, now) {
        return SlotVerdict::Past;
    }
    if calendar.is_weekend(at.date) {
        return SlotVerdict::Weekend;
    }
    if !calendar.is_grid_slot(at.slot) {
        return SlotVerdict::InvalidSlot;
    }
    match blackouts.block_for(at.date, at.slot) {
        Some(Block::Day) => return SlotVerdict::DayBlocked,
        Some(Block::Slot) => return SlotVerdict::SlotBlocked,
        None => {}
    }
    if let Some(ps) = property
        && let Some(holder) = ps.active_at(at, exclude)
    {
        return SlotVerdict::Taken(holder.id);
    }
    SlotVerdict::Free
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_property_id(property_id: &str) -> Result<(), EngineError> {
    if property_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("property_id is required".into()));
    }
    check_len(property_id, MAX_PROPERTY_ID_LEN, "property_id too long")
}

pub(crate) fn validate_actor(actor: Option<&str>) -> Result<(), EngineError> {
    if let Some(a) = actor {
        check_len(a, MAX_ACTOR_ID_LEN, "actor id too long")?;
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if let Some(n) = notes {
        check_len(n, MAX_NOTES_LEN, "notes too long")?;
    }
    Ok(())
}

pub(crate) fn validate_client(client: &ClientInfo) -> Result<(), EngineError> {
    validate_client_name(&client.name)?;
    validate_client_email(&client.email)?;
    validate_client_phone(&client.phone)
}

pub(crate) fn validate_client_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("client name is required".into()));
    }
    check_len(name, MAX_CLIENT_FIELD_LEN, "client name too long")
}

pub(crate) fn validate_client_email(email: &str) -> Result<(), EngineError> {
    let email = email.trim();
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'));
    if !well_formed || email.contains(char::is_whitespace) {
        return Err(EngineError::InvalidInput(format!("malformed client email: {email}")));
    }
    check_len(email, MAX_CLIENT_FIELD_LEN, "client email too long")
}

pub(crate) fn validate_client_phone(phone: &str) -> Result<(), EngineError> {
    if phone.trim().is_empty() {
        return Err(EngineError::InvalidInput("client phone is required".into()));
    }
    check_len(phone, MAX_CLIENT_FIELD_LEN, "client phone too long")
}

pub(crate) fn validate_request(request: &BookingRequest) -> Result<(), EngineError> {
    validate_property_id(&request.property_id)?;
    validate_client(&request.client)?;
    validate_notes(request.notes.as_deref())
}
