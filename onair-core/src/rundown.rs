//! Rundown document model: an ordered tree of folders containing items.
//!
//! Document order is folder-major, then item-minor. All navigation and the
//! prefix-sum clock are defined over that order.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::timer::Cursor;

/// Canonical status string for a rundown that is on air.
pub const STATUS_LIVE: &str = "Live";

/// Status given to newly created rundowns.
pub const STATUS_NEW: &str = "New";

/// Normalize a status string. Every "live" alias maps to [`STATUS_LIVE`].
pub fn normalize_status(status: &str) -> String {
    let trimmed = status.trim();
    match trimmed.to_lowercase().as_str() {
        "live" | "ao vivo" | "aovivo" | "active" | "on air" => STATUS_LIVE.to_string(),
        "" => STATUS_NEW.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Presentation metadata shown by operator and presenter views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Presentation {
    /// Segment kind ("vt", "live", "interview", ...).
    pub kind: String,
    pub icon_type: String,
    pub icon_data: String,
    pub reminder: String,
}

/// Teleprompter fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptFields {
    pub script: String,
    pub talking_points: Vec<String>,
    pub pronunciation_guide: String,
    /// Private notes, only shown on the presenter screen.
    pub presenter_notes: String,
}

/// A single production segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub title: String,
    /// Planned length in seconds.
    pub duration: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub urgency: String,
    #[serde(default)]
    pub presentation: Presentation,
    #[serde(default)]
    pub script: ScriptFields,
}

impl Item {
    pub fn new(title: impl Into<String>, duration: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            duration,
            description: String::new(),
            status: String::new(),
            color: String::new(),
            urgency: String::new(),
            presentation: Presentation::default(),
            script: ScriptFields::default(),
        }
    }
}

/// An ordered group of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub children: Vec<Item>,
}

impl Folder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            children: Vec::new(),
        }
    }

    pub fn with_items(title: impl Into<String>, children: Vec<Item>) -> Self {
        Self {
            children,
            ..Self::new(title)
        }
    }

    /// Sum of the durations of all items in this folder.
    pub fn duration(&self) -> u64 {
        self.children.iter().map(|i| i.duration as u64).sum()
    }
}

/// Errors raised while building or parsing a rundown.
#[derive(Debug, Clone)]
pub enum RundownError {
    /// A folder or item id appears more than once.
    DuplicateId(Uuid),
    /// JSON encoding or decoding failed.
    Json(String),
}

impl std::fmt::Display for RundownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "Duplicate id in rundown: {id}"),
            Self::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for RundownError {}

/// Top-level container, one per production.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rundown {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub items: Vec<Folder>,
}

impl Rundown {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: STATUS_NEW.to_string(),
            items: Vec::new(),
        }
    }

    /// Create with an explicit id (room id chosen by the persistence layer).
    pub fn with_id(id: Uuid, name: impl Into<String>, items: Vec<Folder>) -> Self {
        Self {
            id,
            name: name.into(),
            status: STATUS_NEW.to_string(),
            items,
        }
    }

    /// Item under the cursor, if it resolves.
    pub fn item(&self, cursor: Cursor) -> Option<&Item> {
        self.items
            .get(cursor.folder_index)
            .and_then(|f| f.children.get(cursor.item_index))
    }

    pub fn resolves(&self, cursor: Cursor) -> bool {
        self.item(cursor).is_some()
    }

    /// Sum of the durations of every item strictly before `cursor`.
    ///
    /// A cursor past the end of a folder counts that whole folder.
    pub fn prefix_sum(&self, cursor: Cursor) -> u64 {
        let mut total = 0u64;
        for (fi, folder) in self.items.iter().enumerate() {
            if fi < cursor.folder_index {
                total += folder.duration();
            } else if fi == cursor.folder_index {
                total += folder
                    .children
                    .iter()
                    .take(cursor.item_index)
                    .map(|i| i.duration as u64)
                    .sum::<u64>();
                break;
            } else {
                break;
            }
        }
        total
    }

    /// Cursor of the first item in document order.
    pub fn first_cursor(&self) -> Option<Cursor> {
        self.items
            .iter()
            .position(|f| !f.children.is_empty())
            .map(|fi| Cursor::new(fi, 0))
    }

    /// Next item in the same folder, else the first item of the next
    /// non-empty folder, else `None` (end of rundown).
    pub fn next_cursor(&self, cursor: Cursor) -> Option<Cursor> {
        let folder = self.items.get(cursor.folder_index)?;
        if cursor.item_index + 1 < folder.children.len() {
            return Some(Cursor::new(cursor.folder_index, cursor.item_index + 1));
        }
        self.items
            .iter()
            .enumerate()
            .skip(cursor.folder_index + 1)
            .find(|(_, f)| !f.children.is_empty())
            .map(|(fi, _)| Cursor::new(fi, 0))
    }

    /// Total planned length of the rundown, in seconds.
    pub fn total_duration(&self) -> u64 {
        self.items.iter().map(Folder::duration).sum()
    }

    pub fn item_count(&self) -> usize {
        self.items.iter().map(|f| f.children.len()).sum()
    }

    /// Ensure no folder or item id is used twice.
    pub fn validate_ids(&self) -> Result<(), RundownError> {
        let mut seen = HashSet::new();
        for folder in &self.items {
            if !seen.insert(folder.id) {
                log::warn!("Rundown {} reuses folder id {}", self.id, folder.id);
                return Err(RundownError::DuplicateId(folder.id));
            }
            for item in &folder.children {
                if !seen.insert(item.id) {
                    log::warn!("Rundown {} reuses item id {}", self.id, item.id);
                    return Err(RundownError::DuplicateId(item.id));
                }
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> RundownSummary {
        RundownSummary {
            id: self.id,
            name: self.name.clone(),
            status: self.status.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, RundownError> {
        serde_json::to_string_pretty(self).map_err(|e| RundownError::Json(e.to_string()))
    }

    /// Parse a rundown and reject duplicate ids.
    pub fn from_json(json: &str) -> Result<Self, RundownError> {
        let mut rundown: Rundown =
            serde_json::from_str(json).map_err(|e| RundownError::Json(e.to_string()))?;
        rundown.validate_ids()?;
        let status = normalize_status(&rundown.status);
        if status != rundown.status {
            log::debug!("Rundown {} status '{}' normalized to '{status}'", rundown.id, rundown.status);
            rundown.status = status;
        }
        log::debug!("Parsed rundown '{}' with {} item(s)", rundown.name, rundown.item_count());
        Ok(rundown)
    }
}

/// List-view entry for a rundown, kept current by status updates even when
/// the rundown is not attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RundownSummary {
    pub id: Uuid,
    pub name: String,
    pub status: String,
}

impl RundownSummary {
    pub fn is_live(&self) -> bool {
        self.status == STATUS_LIVE
    }
}
