use crate::model::{InstrumentId, ReservationId};
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Instrument,
    Reservation,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Instrument => f.write_str("instrument"),
            RecordKind::Reservation => f.write_str("reservation"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),
    #[error("slot already booked")]
    Conflict { existing: ReservationId },
    #[error("instrument {instrument} still has {reservations} reservation(s)")]
    ReferentialIntegrity {
        instrument: InstrumentId,
        reservations: usize,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: RecordKind, id: u64 },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl BookingError {
    pub(crate) fn reservation_not_found(id: ReservationId) -> Self {
        BookingError::NotFound {
            kind: RecordKind::Reservation,
            id,
        }
    }

    pub(crate) fn instrument_not_found(id: InstrumentId) -> Self {
        BookingError::NotFound {
            kind: RecordKind::Instrument,
            id,
        }
    }
}

impl From<StorageError> for BookingError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(msg) => BookingError::StorageUnavailable(msg),
            other => BookingError::StorageUnavailable(other.to_string()),
        }
    }
}
