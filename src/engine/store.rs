use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedPropertyState;

/// Reservations partitioned by property. Each property sits behind its own
/// lock; a reverse index resolves reservation id → property.
pub struct ReservationStore {
    properties: DashMap<PropertyId, SharedPropertyState>,
    reservation_to_property: DashMap<Ulid, PropertyId>,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            properties: DashMap::new(),
            reservation_to_property: DashMap::new(),
        }
    }

    // ── Property partitions ──────────────────────────────────

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn get_property(&self, property_id: &str) -> Option<SharedPropertyState> {
        self.properties.get(property_id).map(|e| e.value().clone())
    }

    pub fn get_or_create_property(&self, property_id: &str) -> SharedPropertyState {
        if let Some(existing) = self.get_property(property_id) {
            return existing;
        }
        self.properties
            .entry(property_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(PropertyState::new(property_id.to_string()))))
            .value()
            .clone()
    }

    /// Snapshot of every partition handle. Collected up front so no map
    /// guard is held across an `.await`.
    pub fn property_handles(&self) -> Vec<SharedPropertyState> {
        self.properties.iter().map(|e| e.value().clone()).collect()
    }

    // ── Reservation index ────────────────────────────────────

    pub fn property_for(&self, id: &Ulid) -> Option<PropertyId> {
        self.reservation_to_property.get(id).map(|e| e.value().clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_to_property.len()
    }

    // ── Reads ────────────────────────────────────────────────

    pub async fn get(&self, id: Ulid) -> Option<Reservation> {
        let property_id = self.property_for(&id)?;
        let ps = self.get_property(&property_id)?;
        let guard = ps.read().await;
        guard.get(id).cloned()
    }

    /// An active reservation at `(property_id, slot)` other than `exclude`.
    pub async fn find_conflicting(
        &self,
        property_id: &str,
        slot: &SlotDateTime,
        exclude: Option<Ulid>,
    ) -> Option<Reservation> {
        let ps = self.get_property(property_id)?;
        let guard = ps.read().await;
        guard.active_at(slot, exclude).cloned()
    }

    /// Matching reservations ordered by slot, then id.
    pub async fn list_by_filter(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let handles = match &filter.property_id {
            Some(pid) => self.get_property(pid).into_iter().collect(),
            None => self.property_handles(),
        };
        let mut out = Vec::new();
        for ps in handles {
            let guard = ps.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| a.slot.cmp(&b.slot).then(a.id.cmp(&b.id)));
        out
    }

    /// Pending reservations whose slot began before `local_now`.
    pub async fn list_expired_candidates(&self, local_now: NaiveDateTime) -> Vec<(PropertyId, Ulid)> {
        self.list_passed(local_now, ReservationStatus::Pending).await
    }

    /// Confirmed reservations whose slot began before `local_now`.
    pub async fn list_completed_candidates(&self, local_now: NaiveDateTime) -> Vec<(PropertyId, Ulid)> {
        self.list_passed(local_now, ReservationStatus::Confirmed).await
    }

    async fn list_passed(&self, local_now: NaiveDateTime, status: ReservationStatus) -> Vec<(PropertyId, Ulid)> {
        let mut out = Vec::new();
        for ps in self.property_handles() {
            let guard = ps.read().await;
            // Sorted by slot: stop at the first reservation that hasn't started.
            for r in guard.reservations.iter().take_while(|r| r.slot.naive() < local_now) {
                if r.status == status {
                    out.push((guard.property_id.clone(), r.id));
                }
            }
        }
        out
    }

    // ── Writes (caller holds the property write lock) ────────

    pub fn insert(&self, ps: &mut PropertyState, reservation: Reservation) {
        self.reservation_to_property
            .insert(reservation.id, ps.property_id.clone());
        ps.insert_reservation(reservation);
    }

    pub fn remove(&self, ps: &mut PropertyState, id: Ulid) -> Option<Reservation> {
        self.reservation_to_property.remove(&id);
        ps.remove_reservation(id)
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, ps: &mut PropertyState, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                self.insert(ps, reservation.clone());
            }
            Event::ReservationRescheduled {
                id,
                slot,
                updated_at,
                ..
            } => {
                // Slot changes move the entry, so re-insert to keep the sort order.
                if let Some(mut r) = ps.remove_reservation(*id) {
                    r.slot = *slot;
                    r.updated_at = *updated_at;
                    ps.insert_reservation(r);
                }
            }
            Event::ReservationStatusChanged {
                id,
                status,
                updated_at,
                ..
            } => {
                if let Some(r) = ps.get_mut(*id) {
                    r.status = *status;
                    r.updated_at = *updated_at;
                }
            }
            Event::ReservationsSwept {
                ids,
                status,
                updated_at,
                ..
            } => {
                for id in ids {
                    if let Some(r) = ps.get_mut(*id) {
                        r.status = *status;
                        r.updated_at = *updated_at;
                    }
                }
            }
            Event::ReservationAmended {
                id,
                client,
                kind,
                notes,
                updated_at,
                ..
            } => {
                if let Some(r) = ps.get_mut(*id) {
                    r.client = client.clone();
                    r.kind = *kind;
                    r.notes = notes.clone();
                    r.updated_at = *updated_at;
                }
            }
            Event::ReservationRemoved { id, .. } => {
                self.remove(ps, *id);
            }
            Event::BlackoutAdded { .. } | Event::BlackoutRemoved { .. } => {}
        }
    }
}
