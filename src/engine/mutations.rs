use chrono::{NaiveDate, Utc};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::index::UniqueIndex;
use super::policy::{
    check_booking_policy, check_cancellation_policy, normalize_email, normalize_gsm,
    validate_location, validate_name, validate_optional_text, validate_rule, validate_settings,
};
use super::{Engine, EngineError, WalCommand};

fn slot_conflict(business_id: Ulid, date: NaiveDate, slot: TimeSlot) -> EngineError {
    metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
    EngineError::SlotAlreadyBooked {
        business_id,
        date,
        slot,
    }
}

fn claim_email(
    index: &UniqueIndex<String>,
    constraint: &'static str,
    email: &str,
    id: Ulid,
) -> Result<(), EngineError> {
    index
        .claim(email.to_string(), id)
        .map_err(|_| EngineError::DuplicateKey {
            constraint,
            key: email.to_string(),
        })
}

/// Apply a partial contact update in place. Returns true if the email changed.
fn apply_contact(
    update: ContactUpdate,
    name: &mut String,
    surname: &mut String,
    gsm: &mut String,
    email: &mut String,
) -> Result<bool, EngineError> {
    if let Some(n) = update.name {
        validate_name(&n)?;
        *name = n.trim().to_string();
    }
    if let Some(s) = update.surname {
        validate_name(&s)?;
        *surname = s.trim().to_string();
    }
    if let Some(g) = update.gsm {
        *gsm = normalize_gsm(&g)?;
    }
    match update.email {
        Some(e) => {
            let e = normalize_email(&e)?;
            let changed = e != *email;
            *email = e;
            Ok(changed)
        }
        None => Ok(false),
    }
}

impl Engine {
    // ── Users ────────────────────────────────────────────

    pub async fn create_user(&self, input: NewUser) -> Result<User, EngineError> {
        validate_name(&input.name)?;
        validate_name(&input.surname)?;
        let gsm = normalize_gsm(&input.gsm)?;
        let email = normalize_email(&input.email)?;

        let now = Utc::now();
        let user = User {
            id: Ulid::new(),
            name: input.name.trim().to_string(),
            surname: input.surname.trim().to_string(),
            gsm,
            email,
            created_at: now,
            updated_at: now,
        };

        claim_email(&self.store.user_emails, "users.email", &user.email, user.id)?;
        if let Err(e) = self.commit(Event::UserCreated(user.clone())).await {
            self.store.user_emails.release(&user.email, user.id);
            return Err(e);
        }
        debug!(user_id = %user.id, "user created");
        Ok(user)
    }

    pub async fn update_user(&self, id: Ulid, update: ContactUpdate) -> Result<User, EngineError> {
        let _lock = self.store.users.lock(id).await;
        let mut user = self
            .store
            .users
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "user", id })?;

        let email_changed = apply_contact(
            update,
            &mut user.name,
            &mut user.surname,
            &mut user.gsm,
            &mut user.email,
        )?;
        user.updated_at = Utc::now();

        if email_changed {
            claim_email(&self.store.user_emails, "users.email", &user.email, id)?;
        }
        if let Err(e) = self.commit(Event::UserUpdated(user.clone())).await {
            if email_changed {
                self.store.user_emails.release(&user.email, id);
            }
            return Err(e);
        }
        Ok(user)
    }

    /// Remove the account. Its reservations stay as history.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _lock = self.store.users.lock(id).await;
        if !self.store.users.contains(&id) {
            return Err(EngineError::NotFound { entity: "user", id });
        }
        self.commit(Event::UserDeleted { id }).await?;
        info!(user_id = %id, "user deleted");
        Ok(())
    }

    // ── Owners ───────────────────────────────────────────

    pub async fn create_owner(&self, input: NewOwner) -> Result<Owner, EngineError> {
        validate_name(&input.name)?;
        validate_name(&input.surname)?;
        let gsm = normalize_gsm(&input.gsm)?;
        let email = normalize_email(&input.email)?;

        let now = Utc::now();
        let owner = Owner {
            id: Ulid::new(),
            name: input.name.trim().to_string(),
            surname: input.surname.trim().to_string(),
            gsm,
            email,
            owner_type: input.owner_type,
            created_at: now,
            updated_at: now,
        };

        claim_email(&self.store.owner_emails, "owners.email", &owner.email, owner.id)?;
        if let Err(e) = self.commit(Event::OwnerCreated(owner.clone())).await {
            self.store.owner_emails.release(&owner.email, owner.id);
            return Err(e);
        }
        debug!(owner_id = %owner.id, "owner created");
        Ok(owner)
    }

    pub async fn update_owner(
        &self,
        id: Ulid,
        update: ContactUpdate,
        owner_type: Option<OwnerType>,
    ) -> Result<Owner, EngineError> {
        let _lock = self.store.owners.lock(id).await;
        let mut owner = self
            .store
            .owners
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "owner", id })?;

        let email_changed = apply_contact(
            update,
            &mut owner.name,
            &mut owner.surname,
            &mut owner.gsm,
            &mut owner.email,
        )?;
        if let Some(t) = owner_type {
            owner.owner_type = t;
        }
        owner.updated_at = Utc::now();

        if email_changed {
            claim_email(&self.store.owner_emails, "owners.email", &owner.email, id)?;
        }
        if let Err(e) = self.commit(Event::OwnerUpdated(owner.clone())).await {
            if email_changed {
                self.store.owner_emails.release(&owner.email, id);
            }
            return Err(e);
        }
        Ok(owner)
    }

    /// Refused while the owner still has businesses.
    pub async fn delete_owner(&self, id: Ulid) -> Result<(), EngineError> {
        let _lock = self.store.owners.lock(id).await;
        if !self.store.owners.contains(&id) {
            return Err(EngineError::NotFound { entity: "owner", id });
        }
        if self.store.businesses_by_owner.count(&id) > 0 {
            return Err(EngineError::InvalidInput("owner still has businesses"));
        }
        self.commit(Event::OwnerDeleted { id }).await?;
        info!(owner_id = %id, "owner deleted");
        Ok(())
    }

    // ── Businesses ───────────────────────────────────────

    /// Onboard a business. Its reservation settings are created with
    /// defaults in the same call.
    pub async fn create_business(&self, input: NewBusiness) -> Result<Business, EngineError> {
        validate_name(&input.name)?;
        validate_location(&input.location)?;
        let contact_email = input.contact_email.as_deref().map(normalize_email).transpose()?;
        let contact_phone = input.contact_phone.as_deref().map(normalize_gsm).transpose()?;

        // Held so the owner cannot be deleted underneath the new business.
        let _owner_lock = self.store.owners.lock(input.owner_id).await;
        if !self.store.owners.contains(&input.owner_id) {
            return Err(EngineError::NotFound {
                entity: "owner",
                id: input.owner_id,
            });
        }

        let now = Utc::now();
        let business = Business {
            id: Ulid::new(),
            name: input.name.trim().to_string(),
            owner_id: input.owner_id,
            location: input.location,
            contact_email,
            contact_phone,
            created_at: now,
            updated_at: now,
        };
        self.commit(Event::BusinessCreated(business.clone())).await?;

        let settings = ReservationSettings {
            id: Ulid::new(),
            ..ReservationSettings::defaults_for(business.id, now)
        };
        self.insert_settings(settings).await?;

        info!(business_id = %business.id, owner_id = %business.owner_id, "business created");
        Ok(business)
    }

    pub async fn update_business(
        &self,
        id: Ulid,
        update: BusinessUpdate,
    ) -> Result<Business, EngineError> {
        let _lock = self.store.businesses.lock(id).await;
        let mut business = self
            .store
            .businesses
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "business", id })?;

        if let Some(name) = update.name {
            validate_name(&name)?;
            business.name = name.trim().to_string();
        }
        if let Some(location) = update.location {
            validate_location(&location)?;
            business.location = location;
        }
        if let Some(email) = update.contact_email {
            business.contact_email = Some(normalize_email(&email)?);
        }
        if let Some(phone) = update.contact_phone {
            business.contact_phone = Some(normalize_gsm(&phone)?);
        }
        business.updated_at = Utc::now();

        self.commit(Event::BusinessUpdated(business.clone())).await?;
        Ok(business)
    }

    /// Remove a business and its settings. Rules and reservations are
    /// retained for audit and stay queryable by business id.
    pub async fn delete_business(&self, id: Ulid) -> Result<(), EngineError> {
        let _lock = self.store.businesses.lock(id).await;
        if !self.store.businesses.contains(&id) {
            return Err(EngineError::NotFound { entity: "business", id });
        }
        if self.store.settings_for(&id).is_some() {
            self.commit(Event::SettingsDeleted { business_id: id }).await?;
        }
        self.commit(Event::BusinessDeleted { id }).await?;
        self.notify.remove(&id);
        info!(business_id = %id, "business deleted");
        Ok(())
    }

    // ── Reservation settings ─────────────────────────────

    async fn insert_settings(&self, settings: ReservationSettings) -> Result<(), EngineError> {
        self.store
            .settings_by_business
            .claim(settings.business_id, settings.id)
            .map_err(|_| EngineError::DuplicateKey {
                constraint: "reservation_settings.business_id",
                key: settings.business_id.to_string(),
            })?;
        let (business_id, id) = (settings.business_id, settings.id);
        if let Err(e) = self.commit(Event::SettingsSaved(settings)).await {
            self.store.settings_by_business.release(&business_id, id);
            return Err(e);
        }
        Ok(())
    }

    /// Create-or-update the business's settings. Writes serialize on the
    /// business record.
    pub async fn save_settings(
        &self,
        business_id: Ulid,
        update: SettingsUpdate,
    ) -> Result<ReservationSettings, EngineError> {
        let _lock = self.store.businesses.lock(business_id).await;
        if !self.store.businesses.contains(&business_id) {
            return Err(EngineError::NotFound {
                entity: "business",
                id: business_id,
            });
        }

        let now = Utc::now();
        let (mut settings, is_new) = match self.store.settings_for(&business_id) {
            Some(s) => (s, false),
            None => (
                ReservationSettings {
                    id: Ulid::new(),
                    ..ReservationSettings::defaults_for(business_id, now)
                },
                true,
            ),
        };
        if let Some(v) = update.slot_duration_minutes {
            settings.slot_duration_minutes = v;
        }
        if let Some(v) = update.min_advance_minutes {
            settings.min_advance_minutes = v;
        }
        if let Some(v) = update.max_advance_days {
            settings.max_advance_days = v;
        }
        if let Some(v) = update.cancellation_window_minutes {
            settings.cancellation_window_minutes = v;
        }
        if let Some(v) = update.accept_reservations {
            settings.accept_reservations = v;
        }
        validate_settings(&settings)?;
        settings.updated_at = now;

        if is_new {
            self.insert_settings(settings.clone()).await?;
        } else {
            self.commit(Event::SettingsSaved(settings.clone())).await?;
        }
        debug!(%business_id, slot = settings.slot_duration_minutes, "settings saved");
        Ok(settings)
    }

    /// Drop stored settings; the business falls back to defaults.
    pub async fn delete_settings(&self, business_id: Ulid) -> Result<(), EngineError> {
        let _lock = self.store.businesses.lock(business_id).await;
        if self.store.settings_for(&business_id).is_none() {
            return Err(EngineError::NotFound {
                entity: "reservation settings",
                id: business_id,
            });
        }
        self.commit(Event::SettingsDeleted { business_id }).await
    }

    // ── Availability rules ───────────────────────────────

    pub async fn add_rule(
        &self,
        business_id: Ulid,
        def: RuleDefinition,
    ) -> Result<AvailabilityRule, EngineError> {
        validate_rule(&def)?;
        if !self.store.businesses.contains(&business_id) {
            return Err(EngineError::NotFound {
                entity: "business",
                id: business_id,
            });
        }
        if self.store.rules_by_business.count(&business_id) >= MAX_RULES_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many availability rules"));
        }

        let now = Utc::now();
        let rule = AvailabilityRule {
            id: Ulid::new(),
            business_id,
            kind: def.kind,
            open: def.open,
            windows: def.windows,
            blocked: def.blocked,
            priority: def.priority,
            is_active: true,
            block_reason: def.block_reason,
            created_at: now,
            updated_at: now,
        };
        self.commit(Event::RuleAdded(rule.clone())).await?;
        debug!(rule_id = %rule.id, %business_id, kind = rule.kind.label(), "rule added");
        Ok(rule)
    }

    /// Edit an active rule in place.
    pub async fn update_rule(
        &self,
        id: Ulid,
        def: RuleDefinition,
    ) -> Result<AvailabilityRule, EngineError> {
        validate_rule(&def)?;
        let _lock = self.store.rules.lock(id).await;
        let mut rule = self
            .store
            .rules
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "availability rule", id })?;
        if !rule.is_active {
            return Err(EngineError::InvalidInput("rule is deactivated"));
        }

        rule.kind = def.kind;
        rule.open = def.open;
        rule.windows = def.windows;
        rule.blocked = def.blocked;
        rule.priority = def.priority;
        rule.block_reason = def.block_reason;
        rule.updated_at = Utc::now();

        self.commit(Event::RuleUpdated(rule.clone())).await?;
        Ok(rule)
    }

    /// Soft-deactivate. Deactivating an inactive rule is a no-op.
    pub async fn deactivate_rule(&self, id: Ulid) -> Result<AvailabilityRule, EngineError> {
        let _lock = self.store.rules.lock(id).await;
        let mut rule = self
            .store
            .rules
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "availability rule", id })?;
        if !rule.is_active {
            return Ok(rule);
        }

        let at = Utc::now();
        self.commit(Event::RuleDeactivated {
            id,
            business_id: rule.business_id,
            at,
        })
        .await?;
        rule.is_active = false;
        rule.updated_at = at;
        debug!(rule_id = %id, "rule deactivated");
        Ok(rule)
    }

    // ── Booking ──────────────────────────────────────────

    /// Validate a request against resolved availability and policy, then
    /// commit it under the slot uniqueness constraint. Conflicts are
    /// reported, never retried.
    pub async fn book_reservation(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        let result = self.try_book(req).await;
        match &result {
            Ok(r) => {
                metrics::counter!(observability::RESERVATIONS_BOOKED_TOTAL).increment(1);
                info!(
                    reservation_id = %r.id,
                    business_id = %r.business_id,
                    date = %r.reservation_date,
                    slot = %r.time_slot,
                    "reservation booked"
                );
            }
            Err(e) => {
                metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.label())
                    .increment(1);
                debug!("booking rejected: {e}");
            }
        }
        result
    }

    async fn try_book(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        validate_optional_text(req.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        if !self.store.users.contains(&req.user_id) {
            return Err(EngineError::NotFound {
                entity: "user",
                id: req.user_id,
            });
        }

        let settings = self.effective_settings(req.business_id)?;
        let slots = self.resolve_slots(req.business_id, req.date, &settings)?;
        if !slots.contains(&req.time_slot) {
            return Err(EngineError::OutsideAvailability {
                business_id: req.business_id,
                date: req.date,
                slot: req.time_slot,
            });
        }
        check_booking_policy(&settings, req.date, &req.time_slot, self.now())?;

        let now = Utc::now();
        let reservation = Reservation {
            id: Ulid::new(),
            user_id: req.user_id,
            business_id: req.business_id,
            reservation_date: req.date,
            time_slot: req.time_slot,
            status: ReservationStatus::Pending,
            is_confirmed: false,
            is_cancelled: false,
            notes: req.notes,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        // The claim is the authoritative same-start check; the overlap scan
        // under the day lock catches reservations on a different grid.
        let key = reservation.slot_key();
        if self.store.reservation_slots.claim(key, reservation.id).is_err() {
            return Err(slot_conflict(req.business_id, req.date, req.time_slot));
        }
        let _day = self.store.booking_days.lock((req.business_id, req.date)).await;
        if self
            .overlapping_reservation(req.business_id, req.date, &req.time_slot, reservation.id)
            .is_some()
        {
            self.store.reservation_slots.release(&key, reservation.id);
            return Err(slot_conflict(req.business_id, req.date, req.time_slot));
        }
        if let Err(e) = self.commit(Event::ReservationCreated(reservation.clone())).await {
            self.store.reservation_slots.release(&key, reservation.id);
            return Err(e);
        }
        Ok(reservation)
    }

    /// Change notes, or move a reservation to another date or slot. A move
    /// is validated like a new booking and gives up the old slot only once
    /// the new one is committed.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        update: ReservationUpdate,
    ) -> Result<Reservation, EngineError> {
        validate_optional_text(update.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        let _lock = self.store.reservations.lock(id).await;
        let current = self
            .store
            .reservations
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "reservation", id })?;
        if current.status.is_terminal() {
            return Err(EngineError::InvalidInput("reservation is closed"));
        }

        let mut next = current.clone();
        if let Some(date) = update.date {
            next.reservation_date = date;
        }
        if let Some(slot) = update.time_slot {
            next.time_slot = slot;
        }
        if update.notes.is_some() {
            next.notes = update.notes;
        }
        next.updated_at = Utc::now();

        let moved = next.reservation_date != current.reservation_date
            || next.time_slot != current.time_slot;
        if !moved {
            self.commit(Event::ReservationUpdated(next.clone())).await?;
            return Ok(next);
        }

        let (business_id, date, slot) = (next.business_id, next.reservation_date, next.time_slot);
        let settings = self.effective_settings(business_id)?;
        if !self.resolve_slots(business_id, date, &settings)?.contains(&slot) {
            return Err(EngineError::OutsideAvailability { business_id, date, slot });
        }
        check_cancellation_policy(&settings, &current, self.now())?;
        check_booking_policy(&settings, date, &slot, self.now())?;

        let key = next.slot_key();
        // Same start keeps the key this reservation already owns.
        let fresh_key = key != current.slot_key();
        if self.store.reservation_slots.claim(key, id).is_err() {
            return Err(slot_conflict(business_id, date, slot));
        }
        let _day = self.store.booking_days.lock((business_id, date)).await;
        if self.overlapping_reservation(business_id, date, &slot, id).is_some() {
            if fresh_key {
                self.store.reservation_slots.release(&key, id);
            }
            return Err(slot_conflict(business_id, date, slot));
        }
        if let Err(e) = self.commit(Event::ReservationUpdated(next.clone())).await {
            if fresh_key {
                self.store.reservation_slots.release(&key, id);
            }
            return Err(e);
        }

        info!(
            reservation_id = %id,
            from_date = %current.reservation_date,
            from_slot = %current.time_slot,
            to_date = %date,
            to_slot = %slot,
            "reservation rescheduled"
        );
        Ok(next)
    }

    /// Cancel and free the slot. Cancelling a cancelled reservation returns
    /// it unchanged.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        validate_optional_text(reason.as_deref(), MAX_REASON_LEN, "cancellation reason too long")?;
        let r = self.transition(id, ReservationStatus::Cancelled, reason).await?;
        metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        Ok(r)
    }

    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Confirmed, None).await
    }

    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Completed, None).await
    }

    async fn transition(
        &self,
        id: Ulid,
        to: ReservationStatus,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let _lock = self.store.reservations.lock(id).await;
        let mut r = self
            .store
            .reservations
            .get(&id)
            .ok_or(EngineError::NotFound { entity: "reservation", id })?;

        if to.is_cancelled() && r.status.is_cancelled() {
            return Ok(r);
        }
        if !r.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from: r.status, to });
        }
        if to.is_cancelled() {
            let settings = self.settings_or_default(r.business_id);
            check_cancellation_policy(&settings, &r, self.now())?;
        }

        let at = Utc::now();
        self.commit(Event::ReservationStatusChanged {
            id,
            business_id: r.business_id,
            status: to,
            reason: reason.clone(),
            at,
        })
        .await?;

        let from = r.status;
        r.set_status(to, at);
        if reason.is_some() {
            r.cancellation_reason = reason;
        }
        info!(reservation_id = %id, %from, %to, "reservation status changed");
        Ok(r)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as one record per live entity.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
