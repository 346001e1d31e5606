//! Change event reference resolution

use crate::audit::{self, ChangeEvent};
use crate::error::{Result, TabledgerError};
use crate::state::{self, ImageChain};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use duckdb::Connection;

/// Shortest id prefix accepted as a reference
pub const MIN_PREFIX_LEN: usize = 4;

/// Reference to a change event as typed on the command line
#[derive(Debug, Clone, PartialEq)]
pub enum EventRef {
    /// Full id or unique prefix
    Id(String),
    /// Event that produced the n-th image back from HEAD (`HEAD` is 0)
    Head(usize),
    /// Latest event started at or before the instant
    AtTime(DateTime<Utc>),
}

impl EventRef {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("head") {
            return Ok(Self::Head(0));
        }
        if let Some(n) = s.strip_prefix("HEAD~").or_else(|| s.strip_prefix("head~")) {
            let n = n.parse::<usize>().map_err(|_| {
                TabledgerError::invalid_input(format!("Invalid HEAD offset in '{}'", s))
            })?;
            return Ok(Self::Head(n));
        }
        if let Some(date) = s.strip_prefix('@') {
            return Ok(Self::AtTime(parse_date_string(date)?));
        }
        if s.len() < MIN_PREFIX_LEN {
            return Err(TabledgerError::invalid_input(format!(
                "Event reference '{}' is too short; use at least {} characters",
                s, MIN_PREFIX_LEN
            )));
        }
        Ok(Self::Id(s.to_string()))
    }
}

/// Resolves event references against the ledger
pub struct EventResolver<'c> {
    conn: &'c Connection,
}

impl<'c> EventResolver<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn resolve_str(&self, reference: &str) -> Result<ChangeEvent> {
        self.resolve(&EventRef::parse(reference)?)
    }

    pub fn resolve(&self, reference: &EventRef) -> Result<ChangeEvent> {
        match reference {
            EventRef::Id(id) => self.resolve_by_id(id),
            EventRef::Head(n) => self.resolve_head(*n),
            EventRef::AtTime(ts) => audit::latest_event_at(self.conn, ts)?.ok_or_else(|| {
                TabledgerError::EventNotFound {
                    id: format!("no event started before {}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
                }
            }),
        }
    }

    fn resolve_by_id(&self, id: &str) -> Result<ChangeEvent> {
        if let Some(event) = audit::get_event(self.conn, id)? {
            return Ok(event);
        }

        let mut matches = audit::events_with_prefix(self.conn, id)?;
        match matches.len() {
            0 => Err(TabledgerError::EventNotFound { id: id.to_string() }),
            1 => Ok(matches.remove(0)),
            n => Err(TabledgerError::invalid_input(format!(
                "Event prefix '{}' is ambiguous ({} matches)",
                id, n
            ))),
        }
    }

    fn resolve_head(&self, n: usize) -> Result<ChangeEvent> {
        let image = ImageChain::from_head(self.conn)?
            .nth(n)
            .transpose()?
            .ok_or_else(|| TabledgerError::ImageNotFound {
                id: if n == 0 { "HEAD".to_string() } else { format!("HEAD~{}", n) },
            })?;
        audit::require_event(self.conn, &image.change_event_id)
    }

    /// Image id for `HEAD~n`, or a full image id
    pub fn resolve_image(&self, reference: &str) -> Result<state::StateImage> {
        match EventRef::parse(reference) {
            Ok(EventRef::Head(n)) => ImageChain::from_head(self.conn)?
                .nth(n)
                .transpose()?
                .ok_or_else(|| TabledgerError::ImageNotFound {
                    id: reference.to_string(),
                }),
            _ => match state::get_image(self.conn, reference)? {
                Some(image) => Ok(image),
                None => {
                    let event = self.resolve_str(reference)?;
                    state::image_for_event(self.conn, &event.id)?.ok_or_else(|| TabledgerError::ImageNotFound {
                        id: reference.to_string(),
                    })
                }
            },
        }
    }
}

/// Parse a date string in various formats
fn parse_date_string(date_str: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive_dt) = NaiveDateTime::parse_from_str(date_str, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive_dt));
    }

    // Date only means the end of that day
    if let Ok(naive_date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
        if let Some(naive_dt) = naive_date.and_hms_micro_opt(23, 59, 59, 999_999) {
            return Ok(Utc.from_utc_datetime(&naive_dt));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        return Ok(dt.with_timezone(&Utc));
    }

    Err(TabledgerError::invalid_input(format!(
        "Invalid date format: '{}'. Supported formats: 'YYYY-MM-DD', 'YYYY-MM-DD HH:MM:SS', or ISO 8601",
        date_str
    )))
}
