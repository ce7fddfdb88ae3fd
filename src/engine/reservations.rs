use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::model::*;

use super::conflict::{Verdict, evaluate};
use super::{BookingError, Collection, Shared, next_id, now_ms};

/// Reservation records of one client. Reads serve the local cache; creates
/// and updates run the conflict check and the backend write under the write
/// gate, so no other local mutation can slip between check and write.
pub struct ReservationStore<'a> {
    shared: &'a Shared,
}

impl<'a> ReservationStore<'a> {
    pub(super) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    pub async fn create(&self, draft: ReservationDraft) -> Result<ReservationId, BookingError> {
        let draft = draft.normalized();
        let _gate = self.shared.write_gate.lock().await;

        let id = {
            let cache = self.shared.cache.read().await;
            let verdict = evaluate(&draft, None, cache.reservations.values(), &cache.instruments);
            record_outcome("create", &verdict);
            verdict.into_result()?;
            next_id(cache.reservations.keys().next_back().copied(), now_ms())
        };

        let now = now_ms();
        let reservation = Reservation {
            id,
            instrument_id: draft.instrument_id,
            user: draft.user,
            date: draft.date,
            time_slot: draft.time_slot,
            purpose: draft.purpose,
            contact: draft.contact,
            created_at: now,
            updated_at: now,
        };
        let key = reservation.key();
        self.put(reservation).await?;
        info!(
            "reservation {id} created: instrument {} on {} {}",
            key.instrument_id, key.date, key.time_slot
        );
        Ok(id)
    }

    /// Rewrite an existing reservation in place. Its own slot never counts
    /// as a conflict.
    pub async fn update(&self, id: ReservationId, patch: ReservationPatch) -> Result<(), BookingError> {
        let _gate = self.shared.write_gate.lock().await;

        let updated = {
            let cache = self.shared.cache.read().await;
            let current = cache
                .reservations
                .get(&id)
                .ok_or(BookingError::reservation_not_found(id))?;
            let draft = patch.apply_to(current).normalized();
            let verdict = evaluate(
                &draft,
                Some(EditTarget { id }),
                cache.reservations.values(),
                &cache.instruments,
            );
            record_outcome("update", &verdict);
            verdict.into_result()?;
            Reservation {
                id,
                instrument_id: draft.instrument_id,
                user: draft.user,
                date: draft.date,
                time_slot: draft.time_slot,
                purpose: draft.purpose,
                contact: draft.contact,
                created_at: current.created_at,
                updated_at: now_ms().max(current.updated_at),
            }
        };

        self.put(updated).await?;
        info!("reservation {id} updated");
        Ok(())
    }

    pub async fn delete(&self, id: ReservationId) -> Result<(), BookingError> {
        let _gate = self.shared.write_gate.lock().await;
        if !self.shared.cache.read().await.reservations.contains_key(&id) {
            return Err(BookingError::reservation_not_found(id));
        }
        let revision = self.shared.delete_record(Collection::Reservations, id).await?;
        self.shared
            .apply_local(Collection::Reservations, revision, |cache| {
                cache.reservations.remove(&id);
            })
            .await;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => "delete", "outcome" => "accepted")
            .increment(1);
        info!("reservation {id} deleted");
        Ok(())
    }

    pub async fn get(&self, id: ReservationId) -> Option<Reservation> {
        self.shared.cache.read().await.reservations.get(&id).cloned()
    }

    pub async fn find_by_key(
        &self,
        instrument_id: InstrumentId,
        date: NaiveDate,
        time_slot: TimeSlot,
    ) -> Option<Reservation> {
        let key = SlotKey {
            instrument_id,
            date,
            time_slot,
        };
        self.shared
            .cache
            .read()
            .await
            .reservations
            .values()
            .find(|r| r.key() == key)
            .cloned()
    }

    pub async fn is_booked(&self, key: SlotKey) -> bool {
        self.find_by_key(key.instrument_id, key.date, key.time_slot)
            .await
            .is_some()
    }

    /// All reservations, ordered by id.
    pub async fn all(&self) -> Vec<Reservation> {
        self.filtered(|_| true).await
    }

    pub async fn by_instrument(&self, instrument_id: InstrumentId) -> Vec<Reservation> {
        self.filtered(|r| r.instrument_id == instrument_id).await
    }

    pub async fn on_date(&self, date: NaiveDate) -> Vec<Reservation> {
        self.filtered(|r| r.date == date).await
    }

    /// Matching reservations, newest date first.
    pub async fn history(&self, filter: HistoryFilter) -> Vec<Reservation> {
        let mut found = self.filtered(|r| filter.matches(r)).await;
        found.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
        found
    }

    /// Slots held by more than one reservation. Local writes never produce
    /// these; they appear when two clients booked the same slot from stale
    /// caches and both writes landed.
    pub async fn collisions(&self) -> Vec<(SlotKey, Vec<ReservationId>)> {
        let cache = self.shared.cache.read().await;
        let mut by_key: BTreeMap<SlotKey, Vec<ReservationId>> = BTreeMap::new();
        for r in cache.reservations.values() {
            by_key.entry(r.key()).or_default().push(r.id);
        }
        by_key.into_iter().filter(|(_, ids)| ids.len() > 1).collect()
    }

    async fn filtered(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        self.shared
            .cache
            .read()
            .await
            .reservations
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }

    async fn put(&self, reservation: Reservation) -> Result<(), BookingError> {
        let revision = self
            .shared
            .put_record(Collection::Reservations, reservation.id, &reservation)
            .await?;
        self.shared
            .apply_local(Collection::Reservations, revision, |cache| {
                cache.reservations.insert(reservation.id, reservation);
            })
            .await;
        Ok(())
    }
}

fn record_outcome(op: &'static str, verdict: &Verdict) {
    let outcome = match verdict {
        Verdict::Accept => "accepted",
        Verdict::Reject(super::Rejection::SlotTaken { existing }) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            warn!("{op} rejected: slot already booked by reservation {existing}");
            "conflict"
        }
        Verdict::Reject(other) => {
            warn!("{op} rejected: {}", other.reason());
            "invalid"
        }
    };
    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}
