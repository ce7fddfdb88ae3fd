use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Unix milliseconds, used for record timestamps and id allocation.
pub type Ms = i64;

pub type InstrumentId = u64;
pub type ReservationId = u64;

/// Bookable part of a day. Ordered morning → evening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSlot {
    Morning,
    Afternoon,
    Evening,
}

impl TimeSlot {
    pub const ALL: [TimeSlot; 3] = [TimeSlot::Morning, TimeSlot::Afternoon, TimeSlot::Evening];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSlot::Morning => "morning",
            TimeSlot::Afternoon => "afternoon",
            TimeSlot::Evening => "evening",
        }
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TimeSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" | "am" => Ok(TimeSlot::Morning),
            "afternoon" | "pm" => Ok(TimeSlot::Afternoon),
            "evening" | "night" => Ok(TimeSlot::Evening),
            other => Err(format!("unknown time slot: {other}")),
        }
    }
}

/// The uniqueness key: at most one reservation per instrument per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub instrument_id: InstrumentId,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: ReservationId,
    pub instrument_id: InstrumentId,
    pub user: String,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            instrument_id: self.instrument_id,
            date: self.date,
            time_slot: self.time_slot,
        }
    }
}

/// Fields a caller supplies to book a slot. Ids and timestamps are assigned
/// by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    pub instrument_id: InstrumentId,
    pub user: String,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub purpose: Option<String>,
    pub contact: Option<String>,
}

impl ReservationDraft {
    pub fn new(instrument_id: InstrumentId, date: NaiveDate, time_slot: TimeSlot, user: impl Into<String>) -> Self {
        Self {
            instrument_id,
            user: user.into(),
            date,
            time_slot,
            purpose: None,
            contact: None,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn key(&self) -> SlotKey {
        SlotKey {
            instrument_id: self.instrument_id,
            date: self.date,
            time_slot: self.time_slot,
        }
    }

    /// Trim free-text fields; blank optional fields become `None`.
    pub fn normalized(mut self) -> Self {
        self.user = self.user.trim().to_string();
        self.purpose = non_blank(self.purpose);
        self.contact = non_blank(self.contact);
        self
    }
}

/// Partial edit of an existing reservation. `None` keeps the current value;
/// `purpose: Some(None)` clears the purpose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub instrument_id: Option<InstrumentId>,
    pub user: Option<String>,
    pub date: Option<NaiveDate>,
    pub time_slot: Option<TimeSlot>,
    pub purpose: Option<Option<String>>,
    pub contact: Option<Option<String>>,
}

impl ReservationPatch {
    /// The draft that results from applying this patch to `current`.
    pub fn apply_to(&self, current: &Reservation) -> ReservationDraft {
        ReservationDraft {
            instrument_id: self.instrument_id.unwrap_or(current.instrument_id),
            user: self.user.clone().unwrap_or_else(|| current.user.clone()),
            date: self.date.unwrap_or(current.date),
            time_slot: self.time_slot.unwrap_or(current.time_slot),
            purpose: match &self.purpose {
                Some(p) => p.clone(),
                None => current.purpose.clone(),
            },
            contact: match &self.contact {
                Some(c) => c.clone(),
                None => current.contact.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentDraft {
    pub name: String,
    pub description: String,
    pub location: String,
}

impl InstrumentDraft {
    pub fn new(name: impl Into<String>, description: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            location: location.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// Identity of the reservation an edit flow is rewriting. Passed explicitly
/// into the conflict check so the record never collides with itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditTarget {
    pub id: ReservationId,
}

/// History query: every bound optional, dates inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub instrument: Option<InstrumentId>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl HistoryFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.instrument.is_none_or(|id| r.instrument_id == id)
            && self.from.is_none_or(|from| r.date >= from)
            && self.to.is_none_or(|to| r.date <= to)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn reservation() -> Reservation {
        Reservation {
            id: 7,
            instrument_id: 1,
            user: "Alice".into(),
            date: date("2024-06-03"),
            time_slot: TimeSlot::Morning,
            purpose: Some("XRD scan".into()),
            contact: None,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    #[test]
    fn time_slot_parse_and_display() {
        assert_eq!("Morning".parse::<TimeSlot>().unwrap(), TimeSlot::Morning);
        assert_eq!(" evening ".parse::<TimeSlot>().unwrap(), TimeSlot::Evening);
        assert_eq!("pm".parse::<TimeSlot>().unwrap(), TimeSlot::Afternoon);
        assert!("noon".parse::<TimeSlot>().is_err());
        assert_eq!(TimeSlot::Afternoon.to_string(), "afternoon");
    }

    #[test]
    fn time_slots_are_ordered_through_the_day() {
        let mut slots = vec![TimeSlot::Evening, TimeSlot::Morning, TimeSlot::Afternoon];
        slots.sort();
        assert_eq!(slots, TimeSlot::ALL.to_vec());
    }

    #[test]
    fn reservation_json_shape() {
        let json = serde_json::to_value(reservation()).unwrap();
        assert_eq!(json["instrumentId"], 1);
        assert_eq!(json["timeSlot"], "morning");
        assert_eq!(json["date"], "2024-06-03");
        assert_eq!(json["createdAt"], 1_000);
        assert!(json.get("contact").is_none());

        let back: Reservation = serde_json::from_value(json).unwrap();
        assert_eq!(back, reservation());
    }

    #[test]
    fn instrument_missing_optional_fields_default() {
        let inst: Instrument =
            serde_json::from_value(serde_json::json!({"id": 3, "name": "AFM"})).unwrap();
        assert_eq!(inst.description, "");
        assert_eq!(inst.location, "");
    }

    #[test]
    fn patch_keeps_unset_fields() {
        let patch = ReservationPatch {
            user: Some("Carol".into()),
            ..Default::default()
        };
        let draft = patch.apply_to(&reservation());
        assert_eq!(draft.user, "Carol");
        assert_eq!(draft.key(), reservation().key());
        assert_eq!(draft.purpose.as_deref(), Some("XRD scan"));
    }

    #[test]
    fn patch_can_clear_purpose() {
        let patch = ReservationPatch {
            purpose: Some(None),
            ..Default::default()
        };
        assert_eq!(patch.apply_to(&reservation()).purpose, None);
    }

    #[test]
    fn draft_normalization_trims_and_drops_blanks() {
        let draft = ReservationDraft::new(1, date("2024-06-03"), TimeSlot::Morning, "  Bob ")
            .with_purpose("   ")
            .with_contact(" ext 42 ")
            .normalized();
        assert_eq!(draft.user, "Bob");
        assert_eq!(draft.purpose, None);
        assert_eq!(draft.contact.as_deref(), Some("ext 42"));
    }

    #[test]
    fn history_filter_bounds_are_inclusive() {
        let r = reservation();
        let on_day = HistoryFilter {
            from: Some(r.date),
            to: Some(r.date),
            ..Default::default()
        };
        assert!(on_day.matches(&r));

        let other_instrument = HistoryFilter {
            instrument: Some(2),
            ..Default::default()
        };
        assert!(!other_instrument.matches(&r));

        let later = HistoryFilter {
            from: Some(date("2024-06-04")),
            ..Default::default()
        };
        assert!(!later.matches(&r));
    }
}
