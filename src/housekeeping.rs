use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability;

/// Compact the WAL whenever appends since the last compaction reach
/// `threshold`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Periodically complete confirmed reservations whose slot has ended.
pub async fn run_completer(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let completed = complete_due(&engine).await;
        if completed > 0 {
            info!(completed, "completed past reservations");
        }
    }
}

/// One completion sweep. Returns how many reservations were completed.
pub async fn complete_due(engine: &Engine) -> usize {
    let mut completed = 0;
    for id in engine.collect_completable(engine.now()) {
        match engine.complete_reservation(id).await {
            Ok(_) => {
                completed += 1;
                metrics::counter!(observability::RESERVATIONS_AUTO_COMPLETED_TOTAL).increment(1);
            }
            // Cancelled or completed since it was collected.
            Err(e) => debug!("completion skip {id}: {e}"),
        }
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, NaiveDateTime, Weekday};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rezcore_test_housekeeping");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn sunday_morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 1, 6).unwrap().and_hms_opt(8, 0, 0).unwrap()
    }

    fn tuesday_morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 1, 8).unwrap().and_hms_opt(8, 0, 0).unwrap()
    }

    async fn booked_monday(engine: &Engine) -> Reservation {
        let owner = engine
            .create_owner(NewOwner {
                name: "Grace".into(),
                surname: "Hopper".into(),
                gsm: "+905551112233".into(),
                email: "grace@example.com".into(),
                owner_type: OwnerType::Individual,
            })
            .await
            .unwrap();
        let business = engine
            .create_business(NewBusiness {
                name: "Harbor Barbers".into(),
                owner_id: owner.id,
                location: Location {
                    place_id: "place-1".into(),
                    address: "1 Quay St".into(),
                    latitude: None,
                    longitude: None,
                },
                contact_email: None,
                contact_phone: None,
            })
            .await
            .unwrap();
        engine
            .add_rule(business.id, RuleDefinition::weekly(Weekday::Mon, vec![TimeSlot::hm(9, 0, 17, 0)]))
            .await
            .unwrap();
        let user = engine
            .create_user(NewUser {
                name: "Ada".into(),
                surname: "Lovelace".into(),
                gsm: "05551234567".into(),
                email: "ada@example.com".into(),
            })
            .await
            .unwrap();
        engine
            .book_reservation(BookingRequest {
                user_id: user.id,
                business_id: business.id,
                date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
                time_slot: TimeSlot::hm(10, 0, 10, 30),
                notes: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_completes_only_ended_confirmed_reservations() {
        let path = test_wal_path("sweep.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()))
            .unwrap()
            .with_clock(sunday_morning);
        let r = booked_monday(&engine).await;

        // Pending reservations are left alone.
        assert!(engine.collect_completable(tuesday_morning()).is_empty());

        engine.confirm_reservation(r.id).await.unwrap();
        assert!(engine.collect_completable(sunday_morning()).is_empty());
        assert_eq!(engine.collect_completable(tuesday_morning()), vec![r.id]);
        drop(engine);

        let engine = Engine::new(path, Arc::new(NotifyHub::new()))
            .unwrap()
            .with_clock(tuesday_morning);
        assert_eq!(complete_due(&engine).await, 1);
        assert_eq!(
            engine.get_reservation(r.id).unwrap().status,
            ReservationStatus::Completed
        );
        assert_eq!(complete_due(&engine).await, 0);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let path = test_wal_path("compactor.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()))
            .unwrap()
            .with_clock(sunday_morning);
        booked_monday(&engine).await;

        let appends = engine.wal_appends_since_compact().await;
        assert!(appends >= 5);
        assert!(!compact_if_due(&engine, appends + 1).await.unwrap());
        assert!(compact_if_due(&engine, appends).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let reopened = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(reopened.list_reservations(&ReservationFilter::default()).len(), 1);
    }
}
