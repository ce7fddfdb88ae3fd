use std::collections::BTreeMap;

use crate::limits::*;
use crate::model::*;

use super::BookingError;

/// Why a candidate was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyUser,
    UnknownInstrument(InstrumentId),
    TooLong(&'static str),
    SlotTaken { existing: ReservationId },
}

impl Rejection {
    pub fn reason(&self) -> String {
        match self {
            Rejection::EmptyUser => "user name is required".into(),
            Rejection::UnknownInstrument(id) => format!("unknown instrument {id}"),
            Rejection::TooLong(field) => format!("{field} too long"),
            Rejection::SlotTaken { .. } => "slot already booked".into(),
        }
    }
}

impl From<Rejection> for BookingError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::SlotTaken { existing } => BookingError::Conflict { existing },
            other => BookingError::Validation(other.reason()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(Rejection),
}

impl Verdict {
    pub fn into_result(self) -> Result<(), BookingError> {
        match self {
            Verdict::Accept => Ok(()),
            Verdict::Reject(r) => Err(r.into()),
        }
    }
}

/// Decide whether `candidate` may be written given `snapshot`.
///
/// Stateless and order-agnostic: the same inputs always give the same
/// verdict. `excluding` names the record being edited, which never collides
/// with itself.
pub fn evaluate<'a>(
    candidate: &ReservationDraft,
    excluding: Option<EditTarget>,
    snapshot: impl IntoIterator<Item = &'a Reservation>,
    instruments: &BTreeMap<InstrumentId, Instrument>,
) -> Verdict {
    if candidate.user.trim().is_empty() {
        return Verdict::Reject(Rejection::EmptyUser);
    }
    if let Some(field) = oversized_field(candidate) {
        return Verdict::Reject(Rejection::TooLong(field));
    }
    if !instruments.contains_key(&candidate.instrument_id) {
        return Verdict::Reject(Rejection::UnknownInstrument(candidate.instrument_id));
    }

    let key = candidate.key();
    let excluded = excluding.map(|t| t.id);
    match snapshot
        .into_iter()
        .find(|r| r.key() == key && Some(r.id) != excluded)
    {
        Some(existing) => Verdict::Reject(Rejection::SlotTaken { existing: existing.id }),
        None => Verdict::Accept,
    }
}

fn oversized_field(candidate: &ReservationDraft) -> Option<&'static str> {
    if candidate.user.len() > MAX_USER_LEN {
        return Some("user name");
    }
    if candidate.purpose.as_ref().is_some_and(|p| p.len() > MAX_PURPOSE_LEN) {
        return Some("purpose");
    }
    if candidate.contact.as_ref().is_some_and(|c| c.len() > MAX_CONTACT_LEN) {
        return Some("contact");
    }
    None
}
