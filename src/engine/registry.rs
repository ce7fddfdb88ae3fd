use tracing::{info, warn};

use crate::limits::*;
use crate::model::*;

use super::{BookingError, Collection, Shared, next_id, now_ms};

/// Instruments written by `seed_defaults` into an empty registry.
pub fn default_instruments() -> Vec<Instrument> {
    [
        (1, "Electron Microscope", "High-resolution electron microscope for materials analysis", "Lab A-101"),
        (2, "X-ray Diffractometer", "Crystal structure analysis", "Lab A-102"),
        (3, "Atomic Force Microscope", "Surface topography analysis", "Lab A-103"),
        (4, "Raman Spectrometer", "Molecular vibration spectroscopy", "Lab B-201"),
    ]
    .into_iter()
    .map(|(id, name, description, location)| Instrument {
        id,
        name: name.into(),
        description: description.into(),
        location: location.into(),
    })
    .collect()
}

/// Bookable instruments. Mutations go through the engine's write gate so a
/// removal's reference check and the reservation writes never interleave.
pub struct InstrumentRegistry<'a> {
    shared: &'a Shared,
}

impl<'a> InstrumentRegistry<'a> {
    pub(super) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    pub async fn add(&self, draft: InstrumentDraft) -> Result<InstrumentId, BookingError> {
        let draft = validate(draft)?;
        let _gate = self.shared.write_gate.lock().await;
        let id = {
            let cache = self.shared.cache.read().await;
            next_id(cache.instruments.keys().next_back().copied(), now_ms())
        };
        let instrument = Instrument {
            id,
            name: draft.name,
            description: draft.description,
            location: draft.location,
        };
        self.put(instrument).await?;
        info!("instrument {id} added");
        Ok(id)
    }

    pub async fn update(&self, id: InstrumentId, patch: InstrumentPatch) -> Result<(), BookingError> {
        let _gate = self.shared.write_gate.lock().await;
        let current = self
            .get(id)
            .await
            .ok_or(BookingError::instrument_not_found(id))?;
        let draft = validate(InstrumentDraft {
            name: patch.name.unwrap_or(current.name),
            description: patch.description.unwrap_or(current.description),
            location: patch.location.unwrap_or(current.location),
        })?;
        self.put(Instrument {
            id,
            name: draft.name,
            description: draft.description,
            location: draft.location,
        })
        .await?;
        info!("instrument {id} updated");
        Ok(())
    }

    /// Delete an instrument nobody has booked. The reference check reads the
    /// reservation cache under the write gate, before any mutation.
    pub async fn remove(&self, id: InstrumentId) -> Result<(), BookingError> {
        let _gate = self.shared.write_gate.lock().await;
        {
            let cache = self.shared.cache.read().await;
            if !cache.instruments.contains_key(&id) {
                return Err(BookingError::instrument_not_found(id));
            }
            let references = cache
                .reservations
                .values()
                .filter(|r| r.instrument_id == id)
                .count();
            if references > 0 {
                metrics::counter!(crate::observability::REFERENTIAL_BLOCKS_TOTAL).increment(1);
                warn!("instrument {id} removal blocked by {references} reservation(s)");
                return Err(BookingError::ReferentialIntegrity {
                    instrument: id,
                    reservations: references,
                });
            }
        }

        let revision = self.shared.delete_record(Collection::Instruments, id).await?;
        self.shared
            .apply_local(Collection::Instruments, revision, |cache| {
                cache.instruments.remove(&id);
            })
            .await;
        info!("instrument {id} removed");
        Ok(())
    }

    pub async fn get(&self, id: InstrumentId) -> Option<Instrument> {
        self.shared.cache.read().await.instruments.get(&id).cloned()
    }

    /// All instruments, ordered by id.
    pub async fn list(&self) -> Vec<Instrument> {
        self.shared.cache.read().await.instruments.values().cloned().collect()
    }

    /// Write the default instruments if the registry is empty once both
    /// collections have loaded. Returns how many were written; a client that
    /// has not loaded yet cannot tell empty from unknown and writes nothing.
    pub async fn seed_defaults(&self) -> Result<usize, BookingError> {
        let _gate = self.shared.write_gate.lock().await;
        {
            let cache = self.shared.cache.read().await;
            if !cache.synced() {
                warn!("registry not loaded yet, skipping default instruments");
                return Ok(0);
            }
            if !cache.instruments.is_empty() {
                return Ok(0);
            }
        }
        let defaults = default_instruments();
        let count = defaults.len();
        for instrument in defaults {
            self.put(instrument).await?;
        }
        info!("seeded {count} default instruments");
        Ok(count)
    }

    async fn put(&self, instrument: Instrument) -> Result<(), BookingError> {
        let revision = self
            .shared
            .put_record(Collection::Instruments, instrument.id, &instrument)
            .await?;
        self.shared
            .apply_local(Collection::Instruments, revision, |cache| {
                cache.instruments.insert(instrument.id, instrument);
            })
            .await;
        Ok(())
    }
}

fn validate(draft: InstrumentDraft) -> Result<InstrumentDraft, BookingError> {
    let draft = InstrumentDraft {
        name: draft.name.trim().to_string(),
        description: draft.description.trim().to_string(),
        location: draft.location.trim().to_string(),
    };
    if draft.name.is_empty() {
        return Err(BookingError::Validation("instrument name is required".into()));
    }
    if draft.name.len() > MAX_NAME_LEN {
        return Err(BookingError::Validation("instrument name too long".into()));
    }
    if draft.description.len() > MAX_DESCRIPTION_LEN {
        return Err(BookingError::Validation("description too long".into()));
    }
    if draft.location.len() > MAX_LOCATION_LEN {
        return Err(BookingError::Validation("location too long".into()));
    }
    Ok(draft)
}
