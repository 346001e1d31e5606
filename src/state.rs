//! State images and the HEAD pointer
//!
//! Images form an append-only arena addressed by id. Every image names its
//! parent, so the history reachable from HEAD is a singly linked chain back
//! to the root. HEAD is the only overwritten record and it only moves through
//! a compare-and-set against the image it replaces.

use crate::audit::{self, ChangeEvent};
use crate::error::{Result, TabledgerError};
use crate::store::{format_ts, now, parse_ts, parse_ts_opt};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Immutable snapshot descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateImage {
    pub id: String,
    pub parent_id: Option<String>,
    pub change_event_id: String,
    pub created_at: DateTime<Utc>,
    /// Digest of every entity's staging content at the time of the image
    pub state_digest: String,
    pub notes: Option<String>,
    /// Materialized archive, relative to the workspace images directory
    pub archive_path: Option<String>,
}

/// The HEAD record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Head {
    pub state_image_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub fn head(conn: &Connection) -> Result<Head> {
    let (state_image_id, updated_at): (Option<String>, Option<String>) = conn
        .query_row(
            "SELECT state_image_id, updated_at FROM state_head WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| TabledgerError::integrity(format!("HEAD record is unreadable: {}", e)))?;

    Ok(Head {
        state_image_id,
        updated_at: parse_ts_opt(updated_at)?,
    })
}

/// Compare-and-set HEAD from `expected` to `new`
pub fn advance_head(conn: &Connection, expected: Option<&str>, new: Option<&str>) -> Result<()> {
    let affected = conn.execute(
        "UPDATE state_head SET state_image_id = ?, updated_at = ?
         WHERE id = 1 AND state_image_id IS NOT DISTINCT FROM CAST(? AS VARCHAR)",
        params![new, format_ts(&now()), expected],
    )?;

    if affected != 1 {
        let found = head(conn)?.state_image_id;
        log::warn!("HEAD moved underneath us: expected {:?}, found {:?}", expected, found);
        return Err(TabledgerError::HeadContention {
            expected: expected.map(str::to_string),
            found,
        });
    }

    log::debug!("HEAD {:?} -> {:?}", expected, new);
    Ok(())
}

const IMAGE_COLUMNS: &str =
    "state_image_id, parent_state_image_id, change_event_id, created_at, state_digest, notes, archive_path";

fn query_images(conn: &Connection, filter: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<StateImage>> {
    let sql = format!("SELECT {} FROM state_images {}", IMAGE_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut images = Vec::new();
    for entry in rows {
        let (id, parent_id, change_event_id, created_at, state_digest, notes, archive_path) = entry?;
        images.push(StateImage {
            id,
            parent_id,
            change_event_id,
            created_at: parse_ts(&created_at)?,
            state_digest,
            notes,
            archive_path,
        });
    }
    Ok(images)
}

pub fn get_image(conn: &Connection, id: &str) -> Result<Option<StateImage>> {
    Ok(query_images(conn, "WHERE state_image_id = ?", &[&id])?.into_iter().next())
}

pub fn require_image(conn: &Connection, id: &str) -> Result<StateImage> {
    get_image(conn, id)?.ok_or_else(|| TabledgerError::ImageNotFound { id: id.to_string() })
}

/// The image produced by an event, if one was taken
pub fn image_for_event(conn: &Connection, event_id: &str) -> Result<Option<StateImage>> {
    Ok(query_images(conn, "WHERE change_event_id = ?", &[&event_id])?.into_iter().next())
}

/// Every image in creation order, reachable or not
pub fn all_images(conn: &Connection) -> Result<Vec<StateImage>> {
    query_images(conn, "ORDER BY created_at, state_image_id", &[])
}

/// Snapshot the state produced by `event` and move HEAD onto it.
///
/// Only a successful or rollback event that is still the latest event with
/// applied changes may be imaged; imaging the same event twice returns the
/// existing image. `materialize` runs after the image is built and before it
/// is recorded, and returns the archive path to store on it.
pub fn create_image<F>(
    conn: &Connection,
    event: &ChangeEvent,
    state_digest: String,
    notes: Option<String>,
    materialize: F,
) -> Result<StateImage>
where
    F: FnOnce(&StateImage) -> Result<Option<String>>,
{
    if let Some(existing) = image_for_event(conn, &event.id)? {
        return Ok(existing);
    }

    if !event.status.can_snapshot() {
        return Err(TabledgerError::invalid_state(format!(
            "event {} is {}; only successful or rollback events can be imaged",
            event.id, event.status
        )));
    }

    if let Some(later) = audit::events_after(conn, event)?
        .into_iter()
        .find(|later| later.counts.applied() > 0)
    {
        return Err(TabledgerError::invalid_state(format!(
            "event {} has been superseded by {}; its state can no longer be imaged",
            event.id, later.id
        )));
    }

    let expected = head(conn)?.state_image_id;
    let mut image = StateImage {
        id: Uuid::new_v4().to_string(),
        parent_id: expected.clone(),
        change_event_id: event.id.clone(),
        created_at: now(),
        state_digest,
        notes,
        archive_path: None,
    };
    image.archive_path = materialize(&image)?;

    conn.execute(
        &format!("INSERT INTO state_images ({}) VALUES (?, ?, ?, ?, ?, ?, ?)", IMAGE_COLUMNS),
        params![
            image.id,
            image.parent_id,
            image.change_event_id,
            format_ts(&image.created_at),
            image.state_digest,
            image.notes,
            image.archive_path,
        ],
    )
    .map_err(|e| TabledgerError::integrity(format!("failed to record state image: {}", e)))?;

    advance_head(conn, expected.as_deref(), Some(&image.id))?;
    log::info!("Created state image {} for event {}", image.id, event.id);
    Ok(image)
}

/// Lazy walk from an image back to the root.
///
/// Finite: a revisited node ends the walk with an integrity error.
/// Restartable: `restart` rewinds to the starting image.
pub struct ImageChain<'c> {
    conn: &'c Connection,
    start: Option<String>,
    next: Option<String>,
    seen: HashSet<String>,
}

impl<'c> ImageChain<'c> {
    pub fn new(conn: &'c Connection, start: Option<String>) -> Self {
        Self {
            conn,
            next: start.clone(),
            start,
            seen: HashSet::new(),
        }
    }

    pub fn from_head(conn: &'c Connection) -> Result<Self> {
        Ok(Self::new(conn, head(conn)?.state_image_id))
    }

    pub fn restart(&mut self) {
        self.next = self.start.clone();
        self.seen.clear();
    }
}

impl Iterator for ImageChain<'_> {
    type Item = Result<StateImage>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        if !self.seen.insert(id.clone()) {
            return Some(Err(TabledgerError::integrity(format!(
                "state image chain revisits {}",
                id
            ))));
        }

        match require_image(self.conn, &id) {
            Ok(image) => {
                self.next = image.parent_id.clone();
                Some(Ok(image))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Chain of images from `image_id` back to the root
pub fn chain_from<'c>(conn: &'c Connection, image_id: &str) -> ImageChain<'c> {
    ImageChain::new(conn, Some(image_id.to_string()))
}

/// Where HEAD belongs after returning to `target`: the target's own image,
/// otherwise the nearest image on the current chain whose event started no
/// later than the target. The flag tells whether the match is exact.
pub fn restore_point(conn: &Connection, target: &ChangeEvent) -> Result<Option<(StateImage, bool)>> {
    if let Some(image) = image_for_event(conn, &target.id)? {
        return Ok(Some((image, true)));
    }

    for image in ImageChain::from_head(conn)? {
        let image = image?;
        let producer = audit::require_event(conn, &image.change_event_id)?;
        if (producer.started_at, producer.id.as_str()) <= (target.started_at, target.id.as_str()) {
            return Ok(Some((image, false)));
        }
    }
    Ok(None)
}

/// Structural problems in the image arena, empty when healthy
pub fn validate_chain(conn: &Connection) -> Result<Vec<String>> {
    let mut issues = Vec::new();
    let images = all_images(conn)?;
    let known: HashSet<&str> = images.iter().map(|i| i.id.as_str()).collect();

    for image in &images {
        if let Some(parent) = &image.parent_id {
            if !known.contains(parent.as_str()) {
                issues.push(format!("Image '{}' references missing parent '{}'", image.id, parent));
            }
        }
        if audit::get_event(conn, &image.change_event_id)?.is_none() {
            issues.push(format!(
                "Image '{}' references unknown event '{}'",
                image.id, image.change_event_id
            ));
        }
    }

    // Every chain must end at a root within as many steps as there are images
    for image in &images {
        let walked = chain_from(conn, &image.id).take(images.len() + 1).count();
        let ends_cleanly = chain_from(conn, &image.id).all(|step| step.is_ok());
        if walked > images.len() || !ends_cleanly {
            issues.push(format!("Image '{}' does not reach a root", image.id));
        }
    }

    if let Some(id) = head(conn)?.state_image_id {
        if !known.contains(id.as_str()) {
            issues.push(format!("HEAD points at unknown image '{}'", id));
        }
    }

    Ok(issues)
}
