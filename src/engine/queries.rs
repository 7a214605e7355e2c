use std::time::Instant;

use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use ulid::Ulid;

use crate::limits::MAX_RANGE_DAYS;
use crate::model::*;
use crate::observability;

use super::availability::{
    blocked_windows, open_windows, partition_slots, resolve_windows, winning_rule,
};
use super::{Engine, EngineError};

impl Engine {
    // ── Point lookups ────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.store
            .users
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "user", id })
    }

    pub fn get_owner(&self, id: Ulid) -> Result<Owner, EngineError> {
        self.store
            .owners
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "owner", id })
    }

    pub fn get_business(&self, id: Ulid) -> Result<Business, EngineError> {
        self.store
            .businesses
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "business", id })
    }

    pub fn get_rule(&self, id: Ulid) -> Result<AvailabilityRule, EngineError> {
        self.store
            .rules
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "availability rule", id })
    }

    pub fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store
            .reservations
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "reservation", id })
    }

    /// Stored settings only; see `effective_settings` for the fallback.
    pub fn get_settings(&self, business_id: Ulid) -> Result<ReservationSettings, EngineError> {
        self.store
            .settings_for(&business_id)
            .ok_or(EngineError::NotFound {
                entity: "reservation settings",
                id: business_id,
            })
    }

    /// Settings in force for a business: stored, or the defaults.
    pub fn effective_settings(&self, business_id: Ulid) -> Result<ReservationSettings, EngineError> {
        if !self.store.businesses.contains(&business_id) {
            return Err(EngineError::NotFound {
                entity: "business",
                id: business_id,
            });
        }
        Ok(self.settings_or_default(business_id))
    }

    pub(super) fn settings_or_default(&self, business_id: Ulid) -> ReservationSettings {
        self.store
            .settings_for(&business_id)
            .unwrap_or_else(|| ReservationSettings::defaults_for(business_id, Utc::now()))
    }

    // ── Secondary lookups ────────────────────────────────

    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        let key = email.trim().to_lowercase();
        self.store
            .user_emails
            .get(&key)
            .and_then(|id| self.store.users.get(&id))
    }

    pub fn find_owner_by_email(&self, email: &str) -> Option<Owner> {
        let key = email.trim().to_lowercase();
        self.store
            .owner_emails
            .get(&key)
            .and_then(|id| self.store.owners.get(&id))
    }

    pub fn owners_by_type(&self, owner_type: OwnerType) -> Vec<Owner> {
        let mut owners = self
            .store
            .owners
            .get_many(&self.store.owners_by_type.get(&owner_type));
        owners.sort_by_key(|o| o.id);
        owners
    }

    pub fn businesses_by_owner(&self, owner_id: Ulid) -> Vec<Business> {
        let mut businesses = self
            .store
            .businesses
            .get_many(&self.store.businesses_by_owner.get(&owner_id));
        businesses.sort_by_key(|b| b.id);
        businesses
    }

    pub fn businesses_by_place_id(&self, place_id: &str) -> Vec<Business> {
        let mut businesses = self
            .store
            .businesses
            .get_many(&self.store.businesses_by_place.get(&place_id.to_string()));
        businesses.sort_by_key(|b| b.id);
        businesses
    }

    /// All rules of a business in creation order.
    pub fn list_rules(&self, business_id: Ulid, include_inactive: bool) -> Vec<AvailabilityRule> {
        let mut rules = self.store.rules_for(&business_id);
        if !include_inactive {
            rules.retain(|r| r.is_active);
        }
        rules
    }

    // ── Availability ─────────────────────────────────────

    pub(super) fn resolve_slots(
        &self,
        business_id: Ulid,
        date: NaiveDate,
        settings: &ReservationSettings,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let rules = self.store.rules_for(&business_id);
        let windows = resolve_windows(business_id, &rules, date)?;
        Ok(partition_slots(&windows, settings.slot_duration_minutes))
    }

    /// Ordered bookable slots of a business on `date`. Empty when closed.
    pub fn resolve_availability(
        &self,
        business_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let started = Instant::now();
        let settings = self.effective_settings(business_id)?;
        let result = self.resolve_slots(business_id, date, &settings);
        metrics::histogram!(observability::AVAILABILITY_RESOLVE_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Per-date slots for the inclusive range `start..=end`.
    pub fn resolve_availability_range(
        &self,
        business_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        if start > end {
            return Err(EngineError::InvalidInput("date range starts after it ends"));
        }
        if (end - start).num_days() + 1 > MAX_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        let settings = self.effective_settings(business_id)?;
        let rules = self.store.rules_for(&business_id);

        let mut days = Vec::new();
        let mut date = start;
        while date <= end {
            let windows = resolve_windows(business_id, &rules, date)?;
            days.push(DayAvailability {
                date,
                slots: partition_slots(&windows, settings.slot_duration_minutes),
            });
            date += Duration::days(1);
        }
        Ok(days)
    }

    /// Every slot of `date` with its state. Open slots are `Booked` when an
    /// active reservation overlaps them and `Blocked` once they fall before
    /// the lead-time cutoff. The winning rule's blocked windows are listed
    /// as `Blocked` with the rule's reason.
    pub fn slot_board(&self, business_id: Ulid, date: NaiveDate) -> Result<Vec<SlotInfo>, EngineError> {
        let started = Instant::now();
        let settings = self.effective_settings(business_id)?;
        let rules = self.store.rules_for(&business_id);
        let Some(rule) = winning_rule(business_id, &rules, date)?.filter(|r| r.open) else {
            return Ok(Vec::new());
        };

        let active = self.active_reservations_on(business_id, date);
        let now = self.now();
        let cutoff = now + Duration::minutes(i64::from(settings.min_advance_minutes));
        let mut board: Vec<SlotInfo> =
            partition_slots(&open_windows(rule), settings.slot_duration_minutes)
                .into_iter()
                .map(|slot| {
                    if let Some(holder) = active.iter().find(|r| r.time_slot.overlaps(&slot)) {
                        return SlotInfo {
                            slot,
                            status: SlotStatus::Booked,
                            reservation_id: Some(holder.id),
                            reason: None,
                        };
                    }
                    let starts_at = slot.starts_at(date);
                    let reason = if starts_at <= now {
                        Some("slot has already started")
                    } else if starts_at < cutoff {
                        Some("inside the lead-time buffer")
                    } else {
                        None
                    };
                    SlotInfo {
                        slot,
                        status: if reason.is_some() {
                            SlotStatus::Blocked
                        } else {
                            SlotStatus::Available
                        },
                        reservation_id: None,
                        reason: reason.map(String::from),
                    }
                })
                .collect();

        let reason = rule.block_reason.clone().unwrap_or_else(|| "blocked".into());
        board.extend(blocked_windows(rule).into_iter().map(|slot| SlotInfo {
            slot,
            status: SlotStatus::Blocked,
            reservation_id: None,
            reason: Some(reason.clone()),
        }));
        board.sort_by_key(|s| s.slot.start);

        metrics::histogram!(observability::AVAILABILITY_RESOLVE_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(board)
    }

    fn active_reservations_on(&self, business_id: Ulid, date: NaiveDate) -> Vec<Reservation> {
        let ids = self.store.reservation_index.by_business_date(business_id, date);
        let mut active = self.store.reservations.get_many(&ids);
        active.retain(|r| !r.is_cancelled);
        active
    }

    /// An active reservation other than `except` whose slot overlaps `slot`.
    pub(super) fn overlapping_reservation(
        &self,
        business_id: Ulid,
        date: NaiveDate,
        slot: &TimeSlot,
        except: Ulid,
    ) -> Option<Ulid> {
        self.active_reservations_on(business_id, date)
            .into_iter()
            .find(|r| r.id != except && r.time_slot.overlaps(slot))
            .map(|r| r.id)
    }

    // ── Reservations ─────────────────────────────────────

    /// Reservations matching every set field of `filter`, ordered by date,
    /// slot start, then creation time.
    pub fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let mut rows = match self.store.reservation_index.candidates(filter) {
            Some(ids) => self.store.reservations.get_many(&ids),
            None => self.store.reservations.values(),
        };
        rows.retain(|r| filter.matches(r));
        rows.sort_by_key(|r| (r.reservation_date, r.time_slot.start, r.created_at, r.id));
        rows
    }

    /// Confirmed reservations whose slot has ended by `now`.
    pub fn collect_completable(&self, now: NaiveDateTime) -> Vec<Ulid> {
        let mut due: Vec<Reservation> = self
            .store
            .reservations
            .get_many(&self.store.reservation_index.by_status(ReservationStatus::Confirmed))
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Confirmed && r.ends_at() <= now)
            .collect();
        due.sort_by_key(|r| r.ends_at());
        due.into_iter().map(|r| r.id).collect()
    }
}
