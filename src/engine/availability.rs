use chrono::NaiveDate;

use crate::calendar::SlotCalendar;
use crate::model::*;

use super::blackout::BlackoutRegistry;
use super::conflict::{check_slot, validate_property_id};
use super::{Engine, EngineError};

// ── Availability ──────────────────────────────────────────────────

/// Free slots of one property on one date, ascending.
///
/// Walks the day's grid through the same predicate a booking uses, so
/// weekends and whole-day blackouts yield nothing, past slots are dropped,
/// and a slot held by a pending or confirmed reservation is never listed.
pub fn available_slots(
    calendar: &SlotCalendar,
    blackouts: &BlackoutRegistry,
    property: Option<&PropertyState>,
    date: NaiveDate,
    now: Ms,
) -> Vec<Slot> {
    if blackouts.is_day_blocked(date) {
        return Vec::new();
    }
    calendar
        .slots_for_day(date)
        .iter()
        .copied()
        .filter(|&slot| {
            check_slot(calendar, blackouts, property, &SlotDateTime::new(date, slot), now, None).is_free()
        })
        .collect()
}

impl Engine {
    pub async fn get_available_slots(
        &self,
        property_id: &str,
        date: NaiveDate,
        now: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_property_id(property_id)?;
        let start = std::time::Instant::now();
        let slots = match self.store.get_property(property_id) {
            Some(ps) => {
                let guard = ps.read().await;
                available_slots(&self.calendar, &self.blackouts, Some(&*guard), date, now)
            }
            None => available_slots(&self.calendar, &self.blackouts, None, date, now),
        };
        metrics::histogram!(crate::observability::AVAILABILITY_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        Ok(slots)
    }
}
