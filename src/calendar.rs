//! Calendar projection: reservations folded into week grids of
//! time slot × weekday cells.
//!
//! Everything here works on `NaiveDate` calendar dates. "Today" is an input,
//! never read from the clock, so projections are reproducible and free of
//! timezone day shifts.

use std::collections::BTreeMap;

use chrono::{Datelike, Days, NaiveDate, TimeDelta};

use crate::model::*;
use crate::sync::{ConnectionStatus, Snapshot, Subscription};

const DAYS_PER_WEEK: u64 = 7;

/// Monday of the week containing `day`. A Sunday belongs to the week that
/// started six days earlier.
pub fn week_start(day: NaiveDate) -> NaiveDate {
    let back = day.weekday().num_days_from_monday() as u64;
    day.checked_sub_days(Days::new(back)).unwrap_or(day)
}

/// Monday `offset` weeks away from the week containing `today`.
pub fn shifted_week_start(today: NaiveDate, offset: i64) -> NaiveDate {
    let start = week_start(today);
    start
        .checked_add_signed(TimeDelta::weeks(offset))
        .unwrap_or(start)
}

/// One reservation as shown in a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub reservation_id: ReservationId,
    pub instrument_id: InstrumentId,
    pub instrument_name: String,
    pub user: String,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    /// Ordered by instrument, then reservation id.
    pub entries: Vec<Entry>,
}

impl Cell {
    pub fn is_open(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One time slot across the seven days of a week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRow {
    pub time_slot: TimeSlot,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekGrid {
    pub start: NaiveDate,
    pub rows: Vec<SlotRow>,
}

impl WeekGrid {
    pub fn end(&self) -> NaiveDate {
        self.start
            .checked_add_days(Days::new(DAYS_PER_WEEK - 1))
            .unwrap_or(self.start)
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        self.start.iter_days().take(DAYS_PER_WEEK as usize).collect()
    }

    pub fn label(&self) -> String {
        format!("{} .. {}", self.start, self.end())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    pub weeks: Vec<WeekGrid>,
    pub filter: Option<InstrumentId>,
}

impl Grid {
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.weeks
            .iter()
            .flat_map(|w| w.rows.iter())
            .flat_map(|row| row.cells.iter())
    }

    pub fn cell(&self, date: NaiveDate, time_slot: TimeSlot) -> Option<&Cell> {
        self.cells()
            .find(|c| c.date == date && c.time_slot == time_slot)
    }

    pub fn booked_count(&self) -> usize {
        self.cells().map(|c| c.entries.len()).sum()
    }
}

/// Fold `reservations` into `weeks` consecutive week grids starting at the
/// Monday of `start`'s week. With `filter` set only that instrument's
/// reservations are placed. Pure: same inputs, same grid.
pub fn project(
    reservations: &[Reservation],
    instruments: &[Instrument],
    start: NaiveDate,
    weeks: usize,
    filter: Option<InstrumentId>,
) -> Grid {
    let names: BTreeMap<InstrumentId, &str> = instruments.iter().map(|i| (i.id, i.name.as_str())).collect();

    let mut placed: BTreeMap<(NaiveDate, TimeSlot), Vec<Entry>> = BTreeMap::new();
    for r in reservations {
        if filter.is_some_and(|id| r.instrument_id != id) {
            continue;
        }
        placed.entry((r.date, r.time_slot)).or_default().push(Entry {
            reservation_id: r.id,
            instrument_id: r.instrument_id,
            instrument_name: names
                .get(&r.instrument_id)
                .copied()
                .unwrap_or("Unknown instrument")
                .to_string(),
            user: r.user.clone(),
            purpose: r.purpose.clone(),
        });
    }
    for entries in placed.values_mut() {
        entries.sort_by_key(|e| (e.instrument_id, e.reservation_id));
    }

    let first = week_start(start);
    let weeks = first
        .iter_weeks()
        .take(weeks)
        .map(|monday| WeekGrid {
            start: monday,
            rows: TimeSlot::ALL
                .into_iter()
                .map(|time_slot| SlotRow {
                    time_slot,
                    cells: monday
                        .iter_days()
                        .take(DAYS_PER_WEEK as usize)
                        .map(|date| Cell {
                            date,
                            time_slot,
                            entries: placed.get(&(date, time_slot)).cloned().unwrap_or_default(),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    Grid { weeks, filter }
}

/// A grid re-projected from one published snapshot.
#[derive(Debug, Clone)]
pub struct LiveView {
    pub version: u64,
    pub status: ConnectionStatus,
    pub grid: Grid,
}

/// Observer that re-runs the projector for every snapshot it receives.
pub struct LiveCalendar {
    subscription: Subscription,
    start: NaiveDate,
    weeks: usize,
    filter: Option<InstrumentId>,
}

impl LiveCalendar {
    pub fn new(subscription: Subscription, start: NaiveDate, weeks: usize) -> Self {
        Self {
            subscription,
            start,
            weeks,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<InstrumentId>) -> Self {
        self.filter = filter;
        self
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Move the projected range. Takes effect from the next view.
    pub fn set_start(&mut self, start: NaiveDate) {
        self.start = start;
    }

    /// Wait for the next snapshot and project it. `None` once the
    /// subscription has ended.
    pub async fn next(&mut self) -> Option<LiveView> {
        let snapshot = self.subscription.next().await?;
        Some(self.view(&snapshot))
    }

    /// Project the newest snapshot over the current range right away.
    pub fn current(&self) -> LiveView {
        self.view(&self.subscription.current())
    }

    fn view(&self, snapshot: &Snapshot) -> LiveView {
        LiveView {
            version: snapshot.version,
            status: snapshot.status,
            grid: project(
                &snapshot.reservations,
                &snapshot.instruments,
                self.start,
                self.weeks,
                self.filter,
            ),
        }
    }

    pub fn unsubscribe(self) {
        self.subscription.unsubscribe();
    }
}
