use chrono::NaiveDate;
use dashmap::DashMap;

use crate::model::*;

/// Administrator-declared exclusions, global across properties.
///
/// Whole-day entries are keyed with `slot: None`. The map is the live view:
/// every committed write is visible to the next read.
pub struct BlackoutRegistry {
    entries: DashMap<BlackoutKey, BlackoutEntry>,
}

impl Default for BlackoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlackoutRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &BlackoutKey) -> Option<BlackoutEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Ordered by date, whole-day entry first, then slot.
    pub fn list(&self) -> Vec<BlackoutEntry> {
        let mut all: Vec<BlackoutEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.key());
        all
    }

    pub fn is_day_blocked(&self, date: NaiveDate) -> bool {
        self.entries
            .contains_key(&BlackoutKey { date, slot: None })
    }

    /// Whole-day entries take precedence over slot entries.
    pub fn block_for(&self, date: NaiveDate, slot: Slot) -> Option<Block> {
        if self.is_day_blocked(date) {
            Some(Block::Day)
        } else if self.entries.contains_key(&BlackoutKey {
            date,
            slot: Some(slot),
        }) {
            Some(Block::Slot)
        } else {
            None
        }
    }

    pub fn is_blocked(&self, date: NaiveDate, slot: Slot) -> bool {
        self.block_for(date, slot).is_some()
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::BlackoutAdded { entry } => {
                // First write wins; re-adding the same key keeps the original entry.
                self.entries.entry(entry.key()).or_insert_with(|| entry.clone());
            }
            Event::BlackoutRemoved { key } => {
                self.entries.remove(key);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    fn added(date: NaiveDate, slot: Option<Slot>, reason: &str) -> Event {
        Event::BlackoutAdded {
            entry: BlackoutEntry {
                date,
                slot,
                reason: Some(reason.into()),
                created_at: 0,
            },
        }
    }

    #[test]
    fn whole_day_blocks_every_slot() {
        let reg = BlackoutRegistry::new();
        let d = date(2025, 10, 14);
        reg.apply_event(&added(d, None, "public holiday"));
        assert_eq!(reg.block_for(d, slot(9, 0)), Some(Block::Day));
        assert_eq!(reg.block_for(d, slot(17, 0)), Some(Block::Day));
        assert!(!reg.is_blocked(date(2025, 10, 15), slot(9, 0)));
    }

    #[test]
    fn slot_entry_blocks_only_that_slot() {
        let reg = BlackoutRegistry::new();
        let d = date(2025, 10, 14);
        reg.apply_event(&added(d, Some(slot(10, 0)), "agent away"));
        assert_eq!(reg.block_for(d, slot(10, 0)), Some(Block::Slot));
        assert_eq!(reg.block_for(d, slot(11, 0)), None);
        assert!(!reg.is_day_blocked(d));
    }

    #[test]
    fn day_takes_precedence_over_slot() {
        let reg = BlackoutRegistry::new();
        let d = date(2025, 10, 14);
        reg.apply_event(&added(d, Some(slot(10, 0)), "agent away"));
        reg.apply_event(&added(d, None, "office closed"));
        assert_eq!(reg.block_for(d, slot(10, 0)), Some(Block::Day));
    }

    #[test]
    fn re_adding_keeps_first_entry() {
        let reg = BlackoutRegistry::new();
        let d = date(2025, 10, 14);
        reg.apply_event(&added(d, None, "first"));
        reg.apply_event(&added(d, None, "second"));
        assert_eq!(reg.len(), 1);
        let entry = reg.get(&BlackoutKey { date: d, slot: None }).unwrap();
        assert_eq!(entry.reason.as_deref(), Some("first"));
    }

    #[test]
    fn remove_missing_is_noop() {
        let reg = BlackoutRegistry::new();
        reg.apply_event(&Event::BlackoutRemoved {
            key: BlackoutKey {
                date: date(2025, 10, 14),
                slot: None,
            },
        });
        assert!(reg.is_empty());
    }

    #[test]
    fn list_orders_day_before_slots() {
        let reg = BlackoutRegistry::new();
        reg.apply_event(&added(date(2025, 10, 15), Some(slot(9, 0)), "a"));
        reg.apply_event(&added(date(2025, 10, 14), Some(slot(11, 0)), "b"));
        reg.apply_event(&added(date(2025, 10, 14), None, "c"));
        let keys: Vec<_> = reg.list().iter().map(|e| (e.date, e.slot)).collect();
        assert_eq!(
            keys,
            vec![
                (date(2025, 10, 14), None),
                (date(2025, 10, 14), Some(slot(11, 0))),
                (date(2025, 10, 15), Some(slot(9, 0))),
            ]
        );
    }
}
