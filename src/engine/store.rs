use std::hash::Hash;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::*;

use super::index::{MultiIndex, ReservationIndex, UniqueIndex};

/// Async write locks keyed by `K`. An entry lives only while some task
/// holds or waits on it.
pub struct LockMap<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> Default for LockMap<K> {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> LockMap<K> {
    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let lock = self.locks.entry(key.clone()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Held lock; drops the map entry on release when nobody else wants it.
pub struct KeyGuard<'a, K: Eq + Hash> {
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        // The owned guard keeps its own Arc; release it before counting.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Keyed collection of records plus a per-record write lock.
///
/// Readers clone rows straight out of the map and never wait on the lock;
/// writers hold the lock across read-modify-persist-apply.
pub struct Table<T> {
    rows: DashMap<Ulid, T>,
    locks: LockMap<Ulid>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
            locks: LockMap::default(),
        }
    }
}

impl<T: Clone> Table<T> {
    pub fn get(&self, id: &Ulid) -> Option<T> {
        self.rows.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.rows.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn values(&self) -> Vec<T> {
        self.rows.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_many(&self, ids: &[Ulid]) -> Vec<T> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Serialize writers on one record id.
    pub async fn lock(&self, id: Ulid) -> KeyGuard<'_, Ulid> {
        self.locks.lock(id).await
    }

    #[cfg(test)]
    pub fn lock_entries(&self) -> usize {
        self.locks.len()
    }

    fn insert(&self, id: Ulid, row: T) {
        self.rows.insert(id, row);
    }

    fn remove(&self, id: &Ulid) -> Option<T> {
        self.rows.remove(id).map(|(_, row)| row)
    }

    fn update(&self, id: &Ulid, f: impl FnOnce(&mut T)) -> bool {
        match self.rows.get_mut(id) {
            Some(mut row) => {
                f(row.value_mut());
                true
            }
            None => false,
        }
    }
}

/// The six logical collections and every constraint and access path over them.
#[derive(Default)]
pub struct Store {
    pub users: Table<User>,
    pub user_emails: UniqueIndex<String>,

    pub owners: Table<Owner>,
    pub owner_emails: UniqueIndex<String>,
    pub owners_by_type: MultiIndex<OwnerType>,

    pub businesses: Table<Business>,
    pub businesses_by_owner: MultiIndex<Ulid>,
    pub businesses_by_place: MultiIndex<String>,

    pub settings: Table<ReservationSettings>,
    /// business id → settings id; one settings record per business.
    pub settings_by_business: UniqueIndex<Ulid>,

    pub rules: Table<AvailabilityRule>,
    pub rules_by_business: MultiIndex<Ulid>,

    pub reservations: Table<Reservation>,
    /// Partial unique constraint: only non-cancelled reservations hold a key.
    pub reservation_slots: UniqueIndex<SlotKey>,
    pub reservation_index: ReservationIndex,
    /// Serializes slot placement within one business day so overlap checks
    /// see every earlier placement.
    pub booking_days: LockMap<(Ulid, NaiveDate)>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings_for(&self, business_id: &Ulid) -> Option<ReservationSettings> {
        self.settings_by_business
            .get(business_id)
            .and_then(|id| self.settings.get(&id))
    }

    pub fn rules_for(&self, business_id: &Ulid) -> Vec<AvailabilityRule> {
        let mut rules = self.rules.get_many(&self.rules_by_business.get(business_id));
        rules.sort_by_key(|r| r.id);
        rules
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. Shared by live commits and WAL replay, so
    /// every index entry written here is idempotent with a prior claim.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::UserCreated(user) | Event::UserUpdated(user) => {
                if let Some(old) = self.users.get(&user.id)
                    && old.email != user.email {
                        self.user_emails.release(&old.email, user.id);
                    }
                self.user_emails.set(user.email.clone(), user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::UserDeleted { id } => {
                if let Some(old) = self.users.remove(id) {
                    self.user_emails.release(&old.email, *id);
                }
            }
            Event::OwnerCreated(owner) | Event::OwnerUpdated(owner) => {
                if let Some(old) = self.owners.get(&owner.id) {
                    if old.email != owner.email {
                        self.owner_emails.release(&old.email, owner.id);
                    }
                    self.owners_by_type.remove(&old.owner_type, &owner.id);
                }
                self.owner_emails.set(owner.email.clone(), owner.id);
                self.owners_by_type.add(owner.owner_type, owner.id);
                self.owners.insert(owner.id, owner.clone());
            }
            Event::OwnerDeleted { id } => {
                if let Some(old) = self.owners.remove(id) {
                    self.owner_emails.release(&old.email, *id);
                    self.owners_by_type.remove(&old.owner_type, id);
                }
            }
            Event::BusinessCreated(business) | Event::BusinessUpdated(business) => {
                if let Some(old) = self.businesses.get(&business.id) {
                    self.businesses_by_owner.remove(&old.owner_id, &old.id);
                    self.businesses_by_place.remove(&old.location.place_id, &old.id);
                }
                self.businesses_by_owner.add(business.owner_id, business.id);
                self.businesses_by_place
                    .add(business.location.place_id.clone(), business.id);
                self.businesses.insert(business.id, business.clone());
            }
            Event::BusinessDeleted { id } => {
                if let Some(old) = self.businesses.remove(id) {
                    self.businesses_by_owner.remove(&old.owner_id, id);
                    self.businesses_by_place.remove(&old.location.place_id, id);
                }
            }
            Event::SettingsSaved(settings) => {
                self.settings_by_business.set(settings.business_id, settings.id);
                self.settings.insert(settings.id, settings.clone());
            }
            Event::SettingsDeleted { business_id } => {
                if let Some(id) = self.settings_by_business.get(business_id) {
                    self.settings_by_business.release(business_id, id);
                    self.settings.remove(&id);
                }
            }
            Event::RuleAdded(rule) | Event::RuleUpdated(rule) => {
                self.rules_by_business.add(rule.business_id, rule.id);
                self.rules.insert(rule.id, rule.clone());
            }
            Event::RuleDeactivated { id, at, .. } => {
                self.rules.update(id, |rule| {
                    rule.is_active = false;
                    rule.updated_at = *at;
                });
            }
            Event::ReservationCreated(reservation) => {
                if !reservation.is_cancelled {
                    self.reservation_slots
                        .set(reservation.slot_key(), reservation.id);
                }
                self.reservation_index.insert(reservation);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationUpdated(reservation) => {
                if let Some(old) = self.reservations.get(&reservation.id) {
                    if !old.is_cancelled && old.slot_key() != reservation.slot_key() {
                        self.reservation_slots.release(&old.slot_key(), old.id);
                    }
                    self.reservation_index.remove(&old);
                }
                if !reservation.is_cancelled {
                    self.reservation_slots
                        .set(reservation.slot_key(), reservation.id);
                }
                self.reservation_index.insert(reservation);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationStatusChanged {
                id,
                status,
                reason,
                at,
                ..
            } => {
                let mut change = None;
                self.reservations.update(id, |r| {
                    change = Some((r.status, r.slot_key()));
                    r.set_status(*status, *at);
                    if reason.is_some() {
                        r.cancellation_reason = reason.clone();
                    }
                });
                if let Some((from, key)) = change {
                    self.reservation_index.move_status(*id, from, *status);
                    if status.is_cancelled() {
                        self.reservation_slots.release(&key, *id);
                    }
                }
            }
        }
    }

    /// Minimal event list that recreates the current state. Nothing is
    /// dropped: cancelled reservations and inactive rules are history.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        events.extend(self.users.values().into_iter().map(Event::UserCreated));
        events.extend(self.owners.values().into_iter().map(Event::OwnerCreated));
        events.extend(self.businesses.values().into_iter().map(Event::BusinessCreated));
        events.extend(self.settings.values().into_iter().map(Event::SettingsSaved));
        events.extend(self.rules.values().into_iter().map(Event::RuleAdded));

        let mut reservations = self.reservations.values();
        // Cancelled first so an active holder of the same key is applied last.
        reservations.sort_by_key(|r| (!r.is_cancelled, r.created_at));
        events.extend(reservations.into_iter().map(Event::ReservationCreated));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn reservation(business_id: Ulid, start: Minute) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            business_id,
            reservation_date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            time_slot: TimeSlot::new(start, start + 30),
            status: ReservationStatus::Pending,
            is_confirmed: false,
            is_cancelled: false,
            notes: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn user(email: &str) -> User {
        let now = Utc::now();
        User {
            id: Ulid::new(),
            name: "Ada".into(),
            surname: "Lovelace".into(),
            gsm: "05551234567".into(),
            email: email.into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn user_email_change_moves_unique_key() {
        let store = Store::new();
        let mut u = user("ada@example.com");
        store.apply_event(&Event::UserCreated(u.clone()));
        assert_eq!(store.user_emails.get(&"ada@example.com".to_string()), Some(u.id));

        u.email = "countess@example.com".into();
        store.apply_event(&Event::UserUpdated(u.clone()));
        assert!(store.user_emails.get(&"ada@example.com".to_string()).is_none());
        assert_eq!(store.user_emails.get(&"countess@example.com".to_string()), Some(u.id));

        store.apply_event(&Event::UserDeleted { id: u.id });
        assert!(store.users.is_empty());
        assert!(store.user_emails.is_empty());
    }

    #[test]
    fn cancelled_reservation_releases_slot() {
        let store = Store::new();
        let b = Ulid::new();
        let r = reservation(b, 600);
        store.apply_event(&Event::ReservationCreated(r.clone()));
        assert_eq!(store.reservation_slots.get(&r.slot_key()), Some(r.id));

        store.apply_event(&Event::ReservationStatusChanged {
            id: r.id,
            business_id: b,
            status: ReservationStatus::Cancelled,
            reason: Some("sick".into()),
            at: Utc::now(),
        });
        assert!(store.reservation_slots.get(&r.slot_key()).is_none());
        let row = store.reservations.get(&r.id).unwrap();
        assert!(row.is_cancelled);
        assert_eq!(row.cancellation_reason.as_deref(), Some("sick"));
        // Never physically removed.
        assert_eq!(store.reservations.len(), 1);
    }

    #[test]
    fn reschedule_moves_slot_key_and_paths() {
        let store = Store::new();
        let b = Ulid::new();
        let r = reservation(b, 600);
        store.apply_event(&Event::ReservationCreated(r.clone()));

        let mut moved = r.clone();
        moved.reservation_date = NaiveDate::from_ymd_opt(2030, 1, 14).unwrap();
        moved.time_slot = TimeSlot::new(660, 690);
        store.apply_event(&Event::ReservationUpdated(moved.clone()));

        assert!(store.reservation_slots.get(&r.slot_key()).is_none());
        assert_eq!(store.reservation_slots.get(&moved.slot_key()), Some(r.id));
        assert!(store
            .reservation_index
            .by_business_date(b, r.reservation_date)
            .is_empty());
        assert_eq!(
            store.reservation_index.by_business_date(b, moved.reservation_date),
            vec![r.id]
        );
        assert_eq!(store.reservations.get(&r.id), Some(moved));
    }

    #[tokio::test]
    async fn lock_entries_are_dropped_on_release() {
        let table: Table<User> = Table::default();
        let id = Ulid::new();
        {
            let _held = table.lock(id).await;
            assert_eq!(table.lock_entries(), 1);
        }
        assert_eq!(table.lock_entries(), 0);
    }

    #[tokio::test]
    async fn lock_entry_survives_while_another_task_waits() {
        let locks = Arc::new(LockMap::<u32>::default());
        let held = locks.lock(1).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(1).await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(locks.len(), 1);
        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn snapshot_replays_to_same_state() {
        let store = Store::new();
        let b = Ulid::new();
        let old = reservation(b, 600);
        store.apply_event(&Event::ReservationCreated(old.clone()));
        store.apply_event(&Event::ReservationStatusChanged {
            id: old.id,
            business_id: b,
            status: ReservationStatus::Cancelled,
            reason: None,
            at: Utc::now(),
        });
        let mut new = reservation(b, 600);
        new.created_at = old.created_at - chrono::Duration::seconds(1);
        store.apply_event(&Event::ReservationCreated(new.clone()));
        store.apply_event(&Event::UserCreated(user("ada@example.com")));

        let replayed = Store::new();
        for e in store.snapshot() {
            replayed.apply_event(&e);
        }
        assert_eq!(replayed.reservations.len(), 2);
        assert_eq!(replayed.users.len(), 1);
        assert_eq!(replayed.reservation_slots.get(&new.slot_key()), Some(new.id));
    }

    #[test]
    fn deactivated_rule_is_kept() {
        let store = Store::new();
        let now = Utc::now();
        let rule = AvailabilityRule {
            id: Ulid::new(),
            business_id: Ulid::new(),
            kind: AvailabilityKind::RecurringWeekly { day_of_week: chrono::Weekday::Mon },
            open: true,
            windows: vec![TimeSlot::hm(9, 0, 17, 0)],
            blocked: vec![],
            priority: 0,
            is_active: true,
            block_reason: None,
            created_at: now,
            updated_at: now,
        };
        store.apply_event(&Event::RuleAdded(rule.clone()));
        store.apply_event(&Event::RuleDeactivated {
            id: rule.id,
            business_id: rule.business_id,
            at: now,
        });
        let rules = store.rules_for(&rule.business_id);
        assert_eq!(rules.len(), 1);
        assert!(!rules[0].is_active);
    }
}
