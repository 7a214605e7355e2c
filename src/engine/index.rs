use std::collections::HashSet;
use std::hash::Hash;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Unique secondary index: key → owning record id.
///
/// `claim` is the store's insert-or-fail primitive. The shard lock held by
/// the entry API makes the check and the insert one step, so of two
/// concurrent claims on the same key exactly one succeeds.
pub struct UniqueIndex<K: Eq + Hash> {
    map: DashMap<K, Ulid>,
}

impl<K: Eq + Hash> Default for UniqueIndex<K> {
    fn default() -> Self {
        Self { map: DashMap::new() }
    }
}

impl<K: Eq + Hash> UniqueIndex<K> {
    /// Claim `key` for `id`. Re-claiming a key already owned by `id` succeeds.
    /// On conflict returns the current owner.
    pub fn claim(&self, key: K, id: Ulid) -> Result<(), Ulid> {
        match self.map.entry(key) {
            Entry::Occupied(e) if *e.get() == id => Ok(()),
            Entry::Occupied(e) => Err(*e.get()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    /// Unconditional set, used when applying committed events.
    pub fn set(&self, key: K, id: Ulid) {
        self.map.insert(key, id);
    }

    /// Release `key` only if `id` still owns it.
    pub fn release(&self, key: &K, id: Ulid) {
        self.map.remove_if(key, |_, owner| *owner == id);
    }

    pub fn get(&self, key: &K) -> Option<Ulid> {
        self.map.get(key).map(|e| *e.value())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Non-unique secondary index: key → set of record ids.
pub struct MultiIndex<K: Eq + Hash> {
    map: DashMap<K, HashSet<Ulid>>,
}

impl<K: Eq + Hash> Default for MultiIndex<K> {
    fn default() -> Self {
        Self { map: DashMap::new() }
    }
}

impl<K: Eq + Hash> MultiIndex<K> {
    pub fn add(&self, key: K, id: Ulid) {
        self.map.entry(key).or_default().insert(id);
    }

    pub fn remove(&self, key: &K, id: &Ulid) {
        if let Some(mut ids) = self.map.get_mut(key) {
            ids.remove(id);
        }
        self.map.remove_if(key, |_, ids| ids.is_empty());
    }

    pub fn get(&self, key: &K) -> Vec<Ulid> {
        self.map
            .get(key)
            .map(|e| e.value().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, key: &K) -> usize {
        self.map.get(key).map_or(0, |e| e.value().len())
    }
}

// ── Reservation access paths ─────────────────────────────────────

/// Access paths over reservations: user, business, date, status, and the
/// compound user+date and business+date paths used for listings.
#[derive(Default)]
pub struct ReservationIndex {
    by_user: MultiIndex<Ulid>,
    by_business: MultiIndex<Ulid>,
    by_date: MultiIndex<NaiveDate>,
    by_status: MultiIndex<ReservationStatus>,
    by_user_date: MultiIndex<(Ulid, NaiveDate)>,
    by_business_date: MultiIndex<(Ulid, NaiveDate)>,
}

impl ReservationIndex {
    pub fn insert(&self, r: &Reservation) {
        self.by_user.add(r.user_id, r.id);
        self.by_business.add(r.business_id, r.id);
        self.by_date.add(r.reservation_date, r.id);
        self.by_status.add(r.status, r.id);
        self.by_user_date.add((r.user_id, r.reservation_date), r.id);
        self.by_business_date.add((r.business_id, r.reservation_date), r.id);
    }

    pub fn remove(&self, r: &Reservation) {
        self.by_user.remove(&r.user_id, &r.id);
        self.by_business.remove(&r.business_id, &r.id);
        self.by_date.remove(&r.reservation_date, &r.id);
        self.by_status.remove(&r.status, &r.id);
        self.by_user_date.remove(&(r.user_id, r.reservation_date), &r.id);
        self.by_business_date.remove(&(r.business_id, r.reservation_date), &r.id);
    }

    pub fn move_status(&self, id: Ulid, from: ReservationStatus, to: ReservationStatus) {
        if from != to {
            self.by_status.remove(&from, &id);
            self.by_status.add(to, id);
        }
    }

    pub fn by_status(&self, status: ReservationStatus) -> Vec<Ulid> {
        self.by_status.get(&status)
    }

    pub fn by_business_date(&self, business_id: Ulid, date: NaiveDate) -> Vec<Ulid> {
        self.by_business_date.get(&(business_id, date))
    }

    /// Candidate ids for `filter` from the most selective matching path.
    /// `None` means no path applies and the caller must scan.
    pub fn candidates(&self, filter: &ReservationFilter) -> Option<Vec<Ulid>> {
        match (filter.business_id, filter.user_id, filter.date) {
            (Some(b), _, Some(d)) => return Some(self.by_business_date.get(&(b, d))),
            (_, Some(u), Some(d)) => return Some(self.by_user_date.get(&(u, d))),
            _ => {}
        }
        if let Some(s) = filter.status {
            return Some(self.by_status.get(&s));
        }
        if let Some(b) = filter.business_id {
            return Some(self.by_business.get(&b));
        }
        if let Some(u) = filter.user_id {
            return Some(self.by_user.get(&u));
        }
        if let Some(d) = filter.date {
            return Some(self.by_date.get(&d));
        }
        if filter.is_cancelled.is_some() || filter.is_confirmed.is_some() {
            let ids = ReservationStatus::ALL
                .into_iter()
                .filter(|s| {
                    filter.is_cancelled.is_none_or(|c| s.is_cancelled() == c)
                        && filter.is_confirmed.is_none_or(|c| s.is_confirmed() == c)
                })
                .flat_map(|s| self.by_status.get(&s))
                .collect();
            return Some(ids);
        }
        None
    }
}
