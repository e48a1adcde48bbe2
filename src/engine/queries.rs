use chrono::Days;
use ulid::Ulid;

use crate::calendar::SlotCalendar;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn calendar(&self) -> &SlotCalendar {
        &self.calendar
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store.get(id).await.ok_or(EngineError::NotFound(id))
    }

    /// Ordered by slot ascending.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && from > to
        {
            return Err(EngineError::InvalidInput("date range starts after it ends".into()));
        }
        Ok(self.store.list_by_filter(filter).await)
    }

    /// Pending and confirmed reservations from now through `days` days ahead.
    pub async fn upcoming_reservations(
        &self,
        now: Ms,
        days: u32,
        owner: Option<&str>,
    ) -> Result<Vec<Reservation>, EngineError> {
        if days > MAX_UPCOMING_DAYS {
            return Err(EngineError::LimitExceeded("look-ahead too long"));
        }
        let local_now = self.calendar.local_now(now);
        let today = local_now.date();
        let until = today
            .checked_add_days(Days::new(u64::from(days)))
            .ok_or_else(|| EngineError::InvalidInput("look-ahead overflows the calendar".into()))?;
        let filter = ReservationFilter {
            owner_id: owner.map(str::to_string),
            from: Some(today),
            to: Some(until),
            ..Default::default()
        };
        let mut upcoming = self.store.list_by_filter(&filter).await;
        upcoming.retain(|r| r.is_active() && r.slot.naive() >= local_now);
        Ok(upcoming)
    }

    /// Counts by status and by kind, every variant present. `owner` scopes
    /// the count to reservations created by that actor.
    pub async fn get_statistics(&self, owner: Option<&str>) -> Statistics {
        let filter = ReservationFilter {
            owner_id: owner.map(str::to_string),
            ..Default::default()
        };
        let mut stats = Statistics::empty();
        for r in self.store.list_by_filter(&filter).await {
            stats.record(&r);
        }
        stats
    }

    pub async fn find_conflicting(
        &self,
        property_id: &str,
        slot: &SlotDateTime,
        exclude: Option<Ulid>,
    ) -> Option<Reservation> {
        self.store.find_conflicting(property_id, slot, exclude).await
    }

    pub fn list_blackouts(&self) -> Vec<BlackoutEntry> {
        self.blackouts.list()
    }

    pub fn is_blocked(&self, slot: &SlotDateTime) -> bool {
        self.blackouts.is_blocked(slot.date, slot.slot)
    }
}
