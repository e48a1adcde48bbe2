use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, SWEEP_COMPLETED_TOTAL, SWEEP_EXPIRED_TOTAL, SWEEP_FAILURES_TOTAL};

use super::conflict::{
    check_slot, validate_actor, validate_client_email, validate_client_name, validate_client_phone,
    validate_notes, validate_request,
};
use super::{Engine, EngineError};

/// What a status change does to a reservation in its current state.
#[derive(Debug, PartialEq, Eq)]
enum Transition {
    Apply,
    Noop,
}

fn plan_transition(from: ReservationStatus, to: ReservationStatus) -> Result<Transition, EngineError> {
    use ReservationStatus::*;
    match (from, to) {
        (Pending, Confirmed) | (Pending | Confirmed, Cancelled) | (Confirmed, Completed) => {
            Ok(Transition::Apply)
        }
        (Confirmed, Confirmed) | (Cancelled, Cancelled) => Ok(Transition::Noop),
        (Cancelled | Expired | Completed, _) => Err(EngineError::AlreadyTerminal(from)),
        _ => Err(EngineError::InvalidTransition { from, to }),
    }
}

impl Engine {
    /// Create a pending reservation if the slot is bookable.
    ///
    /// Calendar and blackout checks run once without the property lock to
    /// reject cheaply, then every check runs again under the write lock
    /// immediately before the insert.
    pub async fn request_booking(
        &self,
        request: BookingRequest,
        actor: Option<&str>,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = self.try_request_booking(request, actor, now).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.code(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_request_booking(
        &self,
        request: BookingRequest,
        actor: Option<&str>,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_request(&request)?;
        validate_actor(actor)?;
        let at = request.slot;

        check_slot(&self.calendar, &self.blackouts, None, &at, now, None).into_result(&at)?;

        let ps = match self.store.get_property(&request.property_id) {
            Some(ps) => ps,
            None => {
                if self.store.property_count() >= MAX_PROPERTIES {
                    return Err(EngineError::LimitExceeded("too many properties"));
                }
                self.store.get_or_create_property(&request.property_id)
            }
        };
        let locks = self.lock_property(ps).await;
        if locks.property.reservations.len() >= MAX_RESERVATIONS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many reservations on property"));
        }
        check_slot(&self.calendar, &self.blackouts, Some(&*locks.property), &at, now, None)
            .into_result(&at)?;

        let reservation = Reservation {
            id: Ulid::new(),
            property_id: request.property_id,
            client: request.client,
            kind: request.kind,
            slot: at,
            status: ReservationStatus::Pending,
            owner_id: actor.map(str::to_string),
            notes: request.notes,
            created_at: now,
            updated_at: now,
        };
        self.commit(
            locks,
            Event::ReservationCreated {
                reservation: reservation.clone(),
            },
        )
        .await?;
        info!(
            id = %reservation.id,
            property = %reservation.property_id,
            slot = %reservation.slot,
            actor = actor.unwrap_or("-"),
            "reservation requested"
        );
        Ok(reservation)
    }

    /// Move an active reservation to another slot, keeping its status.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        new_slot: SlotDateTime,
        actor: Option<&str>,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_actor(actor)?;
        let locks = self.lock_reservation(id).await?;
        let mut updated = locks
            .property
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !updated.is_active() {
            return Err(EngineError::AlreadyTerminal(updated.status));
        }
        check_slot(
            &self.calendar,
            &self.blackouts,
            Some(&*locks.property),
            &new_slot,
            now,
            Some(id),
        )
        .into_result(&new_slot)?;

        let previous = updated.slot;
        updated.slot = new_slot;
        updated.updated_at = now;
        let event = Event::ReservationRescheduled {
            id,
            property_id: updated.property_id.clone(),
            slot: new_slot,
            updated_at: now,
        };
        self.commit(locks, event).await?;
        info!(%id, from = %previous, to = %new_slot, actor = actor.unwrap_or("-"), "reservation rescheduled");
        Ok(updated)
    }

    pub async fn confirm_booking(&self, id: Ulid, actor: Option<&str>, now: Ms) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Confirmed, actor, now).await
    }

    pub async fn cancel_booking(&self, id: Ulid, actor: Option<&str>, now: Ms) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Cancelled, actor, now).await
    }

    pub async fn complete_booking(&self, id: Ulid, actor: Option<&str>, now: Ms) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Completed, actor, now).await
    }

    async fn transition(
        &self,
        id: Ulid,
        to: ReservationStatus,
        actor: Option<&str>,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_actor(actor)?;
        let locks = self.lock_reservation(id).await?;
        let mut updated = locks
            .property
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if plan_transition(updated.status, to)? == Transition::Noop {
            return Ok(updated);
        }

        let from = updated.status;
        updated.status = to;
        updated.updated_at = now;
        let event = Event::ReservationStatusChanged {
            id,
            property_id: updated.property_id.clone(),
            status: to,
            updated_at: now,
        };
        self.commit(locks, event).await?;
        info!(%id, %from, %to, actor = actor.unwrap_or("-"), "reservation status changed");
        Ok(updated)
    }

    /// Replace contact details, visit kind, or notes. Scheduling is untouched.
    pub async fn amend_booking(
        &self,
        id: Ulid,
        amendment: Amendment,
        actor: Option<&str>,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_actor(actor)?;
        if let Some(name) = &amendment.client_name {
            validate_client_name(name)?;
        }
        if let Some(email) = &amendment.client_email {
            validate_client_email(email)?;
        }
        if let Some(phone) = &amendment.client_phone {
            validate_client_phone(phone)?;
        }
        validate_notes(amendment.notes.as_deref())?;

        let locks = self.lock_reservation(id).await?;
        let mut updated = locks
            .property
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if amendment.is_empty() {
            return Ok(updated);
        }

        if let Some(name) = amendment.client_name {
            updated.client.name = name;
        }
        if let Some(email) = amendment.client_email {
            updated.client.email = email;
        }
        if let Some(phone) = amendment.client_phone {
            updated.client.phone = phone;
        }
        if let Some(kind) = amendment.kind {
            updated.kind = kind;
        }
        if let Some(notes) = amendment.notes {
            updated.notes = Some(notes);
        }
        updated.updated_at = now;

        let event = Event::ReservationAmended {
            id,
            property_id: updated.property_id.clone(),
            client: updated.client.clone(),
            kind: updated.kind,
            notes: updated.notes.clone(),
            updated_at: now,
        };
        self.commit(locks, event).await?;
        info!(%id, actor = actor.unwrap_or("-"), "reservation amended");
        Ok(updated)
    }

    /// Delete a reservation outright. Returns the removed record.
    pub async fn remove_booking(&self, id: Ulid, actor: Option<&str>) -> Result<Reservation, EngineError> {
        validate_actor(actor)?;
        let locks = self.lock_reservation(id).await?;
        let removed = locks
            .property
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::ReservationRemoved {
            id,
            property_id: removed.property_id.clone(),
        };
        self.commit(locks, event).await?;
        info!(%id, actor = actor.unwrap_or("-"), "reservation removed");
        Ok(removed)
    }

    // ── Blackouts ────────────────────────────────────────────

    /// Block a whole day (`slot: None`) or one slot. Adding a key that
    /// already exists returns the existing entry unchanged.
    pub async fn add_blackout(
        &self,
        date: NaiveDate,
        slot: Option<Slot>,
        reason: Option<String>,
        now: Ms,
    ) -> Result<BlackoutEntry, EngineError> {
        if let Some(s) = slot
            && !self.calendar.is_grid_slot(s)
        {
            return Err(EngineError::InvalidInput(format!("{s} is not part of the slot grid")));
        }
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::InvalidInput("blackout reason too long".into()));
        }

        let locks = self.lock_blackouts().await;
        let key = BlackoutKey { date, slot };
        if let Some(existing) = self.blackouts.get(&key) {
            return Ok(existing);
        }
        if self.blackouts.len() >= MAX_BLACKOUTS {
            return Err(EngineError::LimitExceeded("too many blackouts"));
        }
        let entry = BlackoutEntry {
            date,
            slot,
            reason,
            created_at: now,
        };
        self.commit_blackout(locks, Event::BlackoutAdded { entry: entry.clone() })
            .await?;
        info!(date = %date, slot = ?slot.map(|s| s.to_string()), "blackout added");
        Ok(entry)
    }

    /// Remove the entry for exactly `(date, slot)`. Absent entries are a no-op.
    pub async fn remove_blackout(
        &self,
        date: NaiveDate,
        slot: Option<Slot>,
    ) -> Result<Option<BlackoutEntry>, EngineError> {
        let locks = self.lock_blackouts().await;
        let key = BlackoutKey { date, slot };
        let Some(existing) = self.blackouts.get(&key) else {
            return Ok(None);
        };
        self.commit_blackout(locks, Event::BlackoutRemoved { key }).await?;
        info!(date = %date, slot = ?slot.map(|s| s.to_string()), "blackout removed");
        Ok(Some(existing))
    }

    // ── Sweeper ──────────────────────────────────────────────

    /// Expire pending reservations whose slot has started, and complete
    /// confirmed ones when enabled.
    ///
    /// Each property is one commit under its own lock. Candidates are
    /// re-checked there, so a reservation confirmed or cancelled after it
    /// was listed is left alone.
    pub async fn sweep(&self, now: Ms) -> SweepReport {
        let local_now = self.calendar.local_now(now);
        let mut batches: BTreeMap<(PropertyId, ReservationStatus), Vec<Ulid>> = BTreeMap::new();
        for (property_id, id) in self.store.list_expired_candidates(local_now).await {
            batches
                .entry((property_id, ReservationStatus::Expired))
                .or_default()
                .push(id);
        }
        if self.complete_confirmed {
            for (property_id, id) in self.store.list_completed_candidates(local_now).await {
                batches
                    .entry((property_id, ReservationStatus::Completed))
                    .or_default()
                    .push(id);
            }
        }

        let mut report = SweepReport::default();
        for ((property_id, status), ids) in batches {
            match self.sweep_property(&property_id, ids, status, now).await {
                Ok(n) if status == ReservationStatus::Expired => report.expired += n,
                Ok(n) => report.completed += n,
                Err(e) => {
                    warn!(property = %property_id, %status, error = %e, "sweep batch failed");
                    metrics::counter!(SWEEP_FAILURES_TOTAL).increment(1);
                    report.failed += 1;
                }
            }
        }

        metrics::counter!(SWEEP_EXPIRED_TOTAL).increment(report.expired as u64);
        metrics::counter!(SWEEP_COMPLETED_TOTAL).increment(report.completed as u64);
        if !report.is_noop() || report.failed > 0 {
            info!(
                expired = report.expired,
                completed = report.completed,
                failed = report.failed,
                "sweep finished"
            );
        }
        report
    }

    pub(super) async fn sweep_property(
        &self,
        property_id: &str,
        candidates: Vec<Ulid>,
        to: ReservationStatus,
        now: Ms,
    ) -> Result<usize, EngineError> {
        let from = match to {
            ReservationStatus::Expired => ReservationStatus::Pending,
            _ => ReservationStatus::Confirmed,
        };
        let Some(ps) = self.store.get_property(property_id) else {
            return Ok(0);
        };
        let local_now = self.calendar.local_now(now);
        let locks = self.lock_property(ps).await;
        let ids: Vec<Ulid> = candidates
            .into_iter()
            .filter(|id| {
                locks
                    .property
                    .get(*id)
                    .is_some_and(|r| r.status == from && r.slot.naive() < local_now)
            })
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let n = ids.len();
        let event = Event::ReservationsSwept {
            property_id: property_id.to_string(),
            ids,
            status: to,
            updated_at: now,
        };
        self.commit(locks, event).await?;
        Ok(n)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Holds the commit gate exclusively, so no commit lands between the
    /// snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.lock_for_compaction().await;

        let mut events = Vec::new();
        for entry in self.blackouts.list() {
            events.push(Event::BlackoutAdded { entry });
        }
        for ps in self.store.property_handles() {
            let guard = ps.read().await;
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
            }
        }

        let count = events.len();
        self.send_compact(events).await?;
        info!(events = count, "WAL compacted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReservationStatus::*;

    #[test]
    fn transition_table() {
        assert_eq!(plan_transition(Pending, Confirmed), Ok(Transition::Apply));
        assert_eq!(plan_transition(Confirmed, Confirmed), Ok(Transition::Noop));
        assert_eq!(plan_transition(Pending, Cancelled), Ok(Transition::Apply));
        assert_eq!(plan_transition(Confirmed, Cancelled), Ok(Transition::Apply));
        assert_eq!(plan_transition(Cancelled, Cancelled), Ok(Transition::Noop));
        assert_eq!(plan_transition(Confirmed, Completed), Ok(Transition::Apply));
        assert_eq!(
            plan_transition(Pending, Completed),
            Err(EngineError::InvalidTransition {
                from: Pending,
                to: Completed
            })
        );
        assert_eq!(plan_transition(Expired, Cancelled), Err(EngineError::AlreadyTerminal(Expired)));
        assert_eq!(plan_transition(Completed, Cancelled), Err(EngineError::AlreadyTerminal(Completed)));
        assert_eq!(plan_transition(Cancelled, Confirmed), Err(EngineError::AlreadyTerminal(Cancelled)));
        assert!(matches!(
            plan_transition(Confirmed, Pending),
            Err(EngineError::InvalidTransition { .. })
        ));
    }
}
