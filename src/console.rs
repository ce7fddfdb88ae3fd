//! Operator console: one text command per line, mapped onto engine
//! operations. Parsing is pure; `execute` runs a parsed command against an
//! engine and reports the outcome through the session's notice board.

use chrono::NaiveDate;

use crate::calendar::{self, Grid};
use crate::engine::{BookingError, Engine};
use crate::feedback::{Notice, NoticeBoard};
use crate::model::*;

/// Parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Instruments,
    AddInstrument(InstrumentDraft),
    EditInstrument { id: InstrumentId, patch: InstrumentPatch },
    RemoveInstrument { id: InstrumentId },
    Book(ReservationDraft),
    Edit { id: ReservationId, patch: ReservationPatch },
    Cancel { id: ReservationId },
    Calendar { instrument: Option<InstrumentId> },
    Week(WeekMove),
    History(HistoryFilter),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekMove {
    Next,
    Prev,
    This,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("unknown command: {0} (try `help`)")]
    UnknownCommand(String),
    #[error("{command}: missing {what}")]
    Missing { command: &'static str, what: &'static str },
    #[error("{command}: unexpected argument {arg}")]
    Unexpected { command: &'static str, arg: String },
    #[error("invalid {what}: {value}")]
    Invalid { what: &'static str, value: String },
}

pub const HELP: &str = "\
commands:
  status
  instruments
  add-instrument name=<name> [description=<text>] [location=<text>]
  edit-instrument <id> [name=..] [description=..] [location=..]
  remove-instrument <id>
  book <instrument> <date> <slot> <user> [purpose=..] [contact=..]
  edit <id> [instrument=..] [date=..] [slot=..] [user=..] [purpose=..] [contact=..]
  cancel <id>
  calendar [instrument]
  week next|prev|this
  history [instrument=..] [from=..] [to=..]
  quit
dates are YYYY-MM-DD, slots morning|afternoon|evening; quote values with spaces";

// ── Tokenizer ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Pair(String, String),
}

/// Split on whitespace outside double quotes. An `=` outside quotes turns
/// the token into a key/value pair.
fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut key: Option<String> = None;
    let mut in_quote = false;
    let mut started = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quote = !in_quote;
                started = true;
            }
            '=' if !in_quote && key.is_none() => {
                key = Some(std::mem::take(&mut current));
                started = true;
            }
            c if c.is_whitespace() && !in_quote => {
                if started {
                    tokens.push(finish(key.take(), std::mem::take(&mut current)));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if in_quote {
        return Err(ParseError::UnterminatedQuote);
    }
    if started {
        tokens.push(finish(key, current));
    }
    Ok(tokens)
}

fn finish(key: Option<String>, value: String) -> Token {
    match key {
        Some(k) => Token::Pair(k.to_ascii_lowercase(), value),
        None => Token::Word(value),
    }
}

/// Positional words and `key=value` options of one command.
struct Args {
    command: &'static str,
    words: std::vec::IntoIter<String>,
    options: Vec<(String, String)>,
}

impl Args {
    fn new(command: &'static str, tokens: Vec<Token>) -> Self {
        let mut words = Vec::new();
        let mut options = Vec::new();
        for token in tokens {
            match token {
                Token::Word(w) => words.push(w),
                Token::Pair(k, v) => options.push((k, v)),
            }
        }
        Self {
            command,
            words: words.into_iter(),
            options,
        }
    }

    fn word(&mut self, what: &'static str) -> Result<String, ParseError> {
        self.words.next().ok_or(ParseError::Missing {
            command: self.command,
            what,
        })
    }

    fn optional_word(&mut self) -> Option<String> {
        self.words.next()
    }

    fn take(&mut self, key: &str) -> Option<String> {
        let pos = self.options.iter().position(|(k, _)| k == key)?;
        Some(self.options.remove(pos).1)
    }

    /// Reject leftovers so typos in option names do not pass silently.
    fn done(mut self) -> Result<(), ParseError> {
        if let Some(word) = self.words.next() {
            return Err(ParseError::Unexpected {
                command: self.command,
                arg: word,
            });
        }
        if let Some((k, v)) = self.options.first() {
            return Err(ParseError::Unexpected {
                command: self.command,
                arg: format!("{k}={v}"),
            });
        }
        Ok(())
    }
}

fn parse_id(raw: &str, what: &'static str) -> Result<u64, ParseError> {
    raw.parse().map_err(|_| ParseError::Invalid {
        what,
        value: raw.to_string(),
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate, ParseError> {
    raw.parse().map_err(|_| ParseError::Invalid {
        what: "date",
        value: raw.to_string(),
    })
}

fn parse_slot(raw: &str) -> Result<TimeSlot, ParseError> {
    raw.parse().map_err(|_| ParseError::Invalid {
        what: "time slot",
        value: raw.to_string(),
    })
}

/// An empty value clears an optional field.
fn clearable(raw: String) -> Option<String> {
    if raw.trim().is_empty() { None } else { Some(raw) }
}

// ── Parser ───────────────────────────────────────────────────

pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let mut tokens = tokenize(line)?.into_iter();
    let name = match tokens.next() {
        None => return Err(ParseError::Empty),
        Some(Token::Word(w)) => w.to_ascii_lowercase(),
        Some(Token::Pair(k, v)) => return Err(ParseError::UnknownCommand(format!("{k}={v}"))),
    };
    let rest: Vec<Token> = tokens.collect();

    match name.as_str() {
        "help" | "?" => no_args("help", rest, Command::Help),
        "status" => no_args("status", rest, Command::Status),
        "instruments" => no_args("instruments", rest, Command::Instruments),
        "quit" | "exit" => no_args("quit", rest, Command::Quit),
        "add-instrument" => {
            let mut args = Args::new("add-instrument", rest);
            let name = args.take("name").ok_or(ParseError::Missing {
                command: "add-instrument",
                what: "name",
            })?;
            let draft = InstrumentDraft::new(
                name,
                args.take("description").unwrap_or_default(),
                args.take("location").unwrap_or_default(),
            );
            args.done()?;
            Ok(Command::AddInstrument(draft))
        }
        "edit-instrument" => {
            let mut args = Args::new("edit-instrument", rest);
            let id = parse_id(&args.word("instrument id")?, "instrument id")?;
            let patch = InstrumentPatch {
                name: args.take("name"),
                description: args.take("description"),
                location: args.take("location"),
            };
            args.done()?;
            Ok(Command::EditInstrument { id, patch })
        }
        "remove-instrument" => {
            let mut args = Args::new("remove-instrument", rest);
            let id = parse_id(&args.word("instrument id")?, "instrument id")?;
            args.done()?;
            Ok(Command::RemoveInstrument { id })
        }
        "book" => {
            let mut args = Args::new("book", rest);
            let instrument = parse_id(&args.word("instrument")?, "instrument id")?;
            let date = parse_date(&args.word("date")?)?;
            let slot = parse_slot(&args.word("time slot")?)?;
            let user = args.word("user")?;
            let mut draft = ReservationDraft::new(instrument, date, slot, user);
            draft.purpose = args.take("purpose");
            draft.contact = args.take("contact");
            args.done()?;
            Ok(Command::Book(draft))
        }
        "edit" => {
            let mut args = Args::new("edit", rest);
            let id = parse_id(&args.word("reservation id")?, "reservation id")?;
            let patch = ReservationPatch {
                instrument_id: args
                    .take("instrument")
                    .map(|v| parse_id(&v, "instrument id"))
                    .transpose()?,
                user: args.take("user"),
                date: args.take("date").map(|v| parse_date(&v)).transpose()?,
                time_slot: args.take("slot").map(|v| parse_slot(&v)).transpose()?,
                purpose: args.take("purpose").map(clearable),
                contact: args.take("contact").map(clearable),
            };
            args.done()?;
            Ok(Command::Edit { id, patch })
        }
        "cancel" => {
            let mut args = Args::new("cancel", rest);
            let id = parse_id(&args.word("reservation id")?, "reservation id")?;
            args.done()?;
            Ok(Command::Cancel { id })
        }
        "calendar" => {
            let mut args = Args::new("calendar", rest);
            let instrument = args
                .optional_word()
                .map(|v| parse_id(&v, "instrument id"))
                .transpose()?;
            args.done()?;
            Ok(Command::Calendar { instrument })
        }
        "week" => {
            let mut args = Args::new("week", rest);
            let direction = args.word("direction")?;
            let step = match direction.to_ascii_lowercase().as_str() {
                "next" => WeekMove::Next,
                "prev" | "previous" => WeekMove::Prev,
                "this" | "current" => WeekMove::This,
                _ => {
                    return Err(ParseError::Invalid {
                        what: "week direction",
                        value: direction,
                    });
                }
            };
            args.done()?;
            Ok(Command::Week(step))
        }
        "history" => {
            let mut args = Args::new("history", rest);
            let filter = HistoryFilter {
                instrument: args
                    .take("instrument")
                    .map(|v| parse_id(&v, "instrument id"))
                    .transpose()?,
                from: args.take("from").map(|v| parse_date(&v)).transpose()?,
                to: args.take("to").map(|v| parse_date(&v)).transpose()?,
            };
            args.done()?;
            Ok(Command::History(filter))
        }
        _ => Err(ParseError::UnknownCommand(name)),
    }
}

fn no_args(command: &'static str, rest: Vec<Token>, cmd: Command) -> Result<Command, ParseError> {
    Args::new(command, rest).done()?;
    Ok(cmd)
}

// ── Execution ────────────────────────────────────────────────

/// Per-console state between commands.
pub struct Session {
    pub week_offset: i64,
    pub weeks: usize,
    pub notices: NoticeBoard,
}

impl Session {
    pub fn new(weeks: usize, notices: NoticeBoard) -> Self {
        Self {
            week_offset: 0,
            weeks,
            notices,
        }
    }

    /// Monday of the first projected week.
    pub fn week_start(&self, today: NaiveDate) -> NaiveDate {
        calendar::shifted_week_start(today, self.week_offset)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl Reply {
    fn lines(lines: Vec<String>) -> Self {
        Self { lines, quit: false }
    }
}

/// Run `cmd`. Failures never escape: they become the session's current
/// notice.
pub async fn execute(engine: &Engine, session: &mut Session, cmd: Command, today: NaiveDate) -> Reply {
    match run(engine, session, cmd, today).await {
        Ok(reply) => reply,
        Err(e) => {
            session.notices.raise(Notice::from(&e));
            Reply::default()
        }
    }
}

async fn run(engine: &Engine, session: &mut Session, cmd: Command, today: NaiveDate) -> Result<Reply, BookingError> {
    match cmd {
        Command::Help => Ok(Reply::lines(HELP.lines().map(String::from).collect())),
        Command::Quit => Ok(Reply {
            lines: Vec::new(),
            quit: true,
        }),
        Command::Status => {
            let snap = engine.snapshot();
            Ok(Reply::lines(vec![format!(
                "storage {} | {} instruments | {} reservations | snapshot v{} | {} observers",
                snap.status.label(),
                snap.instruments.len(),
                snap.reservations.len(),
                snap.version,
                engine.hub().listener_count(),
            )]))
        }
        Command::Instruments => {
            let list = engine.instruments().list().await;
            if list.is_empty() {
                return Ok(Reply::lines(vec!["no instruments".into()]));
            }
            Ok(Reply::lines(
                list.iter()
                    .map(|i| format!("{:>14}  {}  [{}]  {}", i.id, i.name, i.location, i.description))
                    .collect(),
            ))
        }
        Command::AddInstrument(draft) => {
            let id = engine.instruments().add(draft).await?;
            session.notices.raise(Notice::success(format!("instrument {id} added")));
            Ok(Reply::default())
        }
        Command::EditInstrument { id, patch } => {
            engine.instruments().update(id, patch).await?;
            session.notices.raise(Notice::success(format!("instrument {id} updated")));
            Ok(Reply::default())
        }
        Command::RemoveInstrument { id } => {
            engine.instruments().remove(id).await?;
            session.notices.raise(Notice::success(format!("instrument {id} removed")));
            Ok(Reply::default())
        }
        Command::Book(draft) => {
            let id = engine.reservations().create(draft).await?;
            session.notices.raise(Notice::success(format!("reservation {id} booked")));
            Ok(Reply::default())
        }
        Command::Edit { id, patch } => {
            engine.reservations().update(id, patch).await?;
            session.notices.raise(Notice::success(format!("reservation {id} updated")));
            Ok(Reply::default())
        }
        Command::Cancel { id } => {
            engine.reservations().delete(id).await?;
            session.notices.raise(Notice::success(format!("reservation {id} cancelled")));
            Ok(Reply::default())
        }
        Command::Calendar { instrument } => {
            let snap = engine.snapshot();
            let grid = calendar::project(
                &snap.reservations,
                &snap.instruments,
                session.week_start(today),
                session.weeks,
                instrument,
            );
            Ok(Reply::lines(render_grid(&grid)))
        }
        Command::Week(step) => {
            session.week_offset = match step {
                WeekMove::Next => session.week_offset + 1,
                WeekMove::Prev => session.week_offset - 1,
                WeekMove::This => 0,
            };
            session
                .notices
                .raise(Notice::info(format!("showing week of {}", session.week_start(today))));
            Ok(Reply::default())
        }
        Command::History(filter) => {
            let found = engine.reservations().history(filter).await;
            if found.is_empty() {
                session.notices.raise(Notice::info("no matching reservations"));
                return Ok(Reply::default());
            }
            let instruments = engine.instruments().list().await;
            let name_of = |id: InstrumentId| {
                instruments
                    .iter()
                    .find(|i| i.id == id)
                    .map_or("Unknown instrument", |i| i.name.as_str())
            };
            Ok(Reply::lines(
                found
                    .iter()
                    .map(|r| {
                        format!(
                            "{:>14}  {} {:<9}  {}  {}{}",
                            r.id,
                            r.date,
                            r.time_slot,
                            name_of(r.instrument_id),
                            r.user,
                            r.purpose.as_ref().map(|p| format!("  ({p})")).unwrap_or_default(),
                        )
                    })
                    .collect(),
            ))
        }
    }
}

/// Text rendering of a grid: one line per day, slots side by side.
pub fn render_grid(grid: &Grid) -> Vec<String> {
    let mut out = Vec::new();
    for week in &grid.weeks {
        out.push(format!("week {}", week.label()));
        for (day_index, date) in week.days().into_iter().enumerate() {
            let slots: Vec<String> = week
                .rows
                .iter()
                .map(|row| {
                    let cell = &row.cells[day_index];
                    let text = if cell.is_open() {
                        "open".to_string()
                    } else {
                        cell.entries
                            .iter()
                            .map(|e| format!("{} ({})", e.user, e.instrument_name))
                            .collect::<Vec<_>>()
                            .join(", ")
                    };
                    format!("{}: {text}", row.time_slot)
                })
                .collect();
            out.push(format!("  {} {}  {}", date.format("%a"), date, slots.join(" | ")));
        }
    }
    out
}
