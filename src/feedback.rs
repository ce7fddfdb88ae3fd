//! User-facing feedback. Every operation outcome becomes one `Notice`;
//! a notice stays visible until its TTL runs out or a newer one replaces it.

use std::time::Duration;

use tokio::time::Instant;

use crate::engine::BookingError;

pub const DEFAULT_NOTICE_TTL: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn label(&self) -> &'static str {
        match self {
            Level::Success => "ok",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: Level,
    pub text: String,
}

impl Notice {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            level: Level::Success,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.level.label(), self.text)
    }
}

/// Rejections the user can fix are warnings; storage trouble is an error.
impl From<&BookingError> for Notice {
    fn from(err: &BookingError) -> Self {
        match err {
            BookingError::Validation(_)
            | BookingError::Conflict { .. }
            | BookingError::ReferentialIntegrity { .. }
            | BookingError::NotFound { .. } => Notice::warning(err.to_string()),
            BookingError::StorageUnavailable(_) => Notice::error(err.to_string()),
        }
    }
}

struct Shown {
    notice: Notice,
    until: Instant,
}

/// Holds at most one visible notice.
pub struct NoticeBoard {
    ttl: Duration,
    current: Option<Shown>,
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, current: None }
    }

    /// Show `notice`, replacing whatever was visible.
    pub fn raise(&mut self, notice: Notice) {
        self.raise_at(notice, Instant::now());
    }

    pub fn raise_at(&mut self, notice: Notice, now: Instant) {
        self.current = Some(Shown {
            notice,
            until: now + self.ttl,
        });
    }

    pub fn visible(&self) -> Option<&Notice> {
        self.visible_at(Instant::now())
    }

    pub fn visible_at(&self, now: Instant) -> Option<&Notice> {
        self.current
            .as_ref()
            .filter(|shown| now < shown.until)
            .map(|shown| &shown.notice)
    }

    pub fn dismiss(&mut self) {
        self.current = None;
    }
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE_TTL)
    }
}
