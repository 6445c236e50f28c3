//! Drag-and-drop reorder resolution and the drag lock.
//!
//! ```text
//!   pointer_y ──►  ┌────────┐ center 10
//!                  │ A      │
//!                  ├────────┤ center 30   ◄── nearest center
//!       ·  ·  ·  · │ B      │                  pointer above → index 1
//!                  ├────────┤ center 50        pointer below → index 2
//!                  │ C      │
//!                  └────────┘
//! ```

use std::time::Duration;
use tokio::time::Instant;

use onair_core::{Cursor, Folder};

/// Vertical extent of one rendered sibling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiblingBounds {
    pub top: f64,
    pub bottom: f64,
}

impl SiblingBounds {
    pub fn new(top: f64, bottom: f64) -> Self {
        Self { top, bottom }
    }

    pub fn center(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }
}

/// Insertion index for a pointer at `pointer_y`.
///
/// Picks the sibling whose center is nearest (so overlapping boxes still
/// resolve), then inserts before it if the pointer is above its center and
/// after it otherwise. Result is in `[0, siblings.len()]`.
pub fn drop_index(siblings: &[SiblingBounds], pointer_y: f64) -> usize {
    let nearest = siblings
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            let da = (a.center() - pointer_y).abs();
            let db = (b.center() - pointer_y).abs();
            da.total_cmp(&db)
        });

    match nearest {
        None => 0,
        Some((index, bounds)) if pointer_y < bounds.center() => index,
        Some((index, _)) => (index + 1).min(siblings.len()),
    }
}

/// Move `list[from]` so it lands at insertion point `insert`.
///
/// `insert` is expressed against the list *before* removal, so it is
/// decremented when it lies after `from`. Both indices clamp. Returns
/// whether the order changed.
pub fn move_within<T>(list: &mut Vec<T>, from: usize, insert: usize) -> bool {
    if list.is_empty() {
        return false;
    }
    let from = from.min(list.len() - 1);
    let mut insert = insert.min(list.len());
    if insert > from {
        insert -= 1;
    }
    if insert == from {
        return false;
    }
    let moved = list.remove(from);
    list.insert(insert, moved);
    true
}

/// Move the item at `from` into folder `to_folder` at `insert`.
///
/// Same-folder moves defer to [`move_within`]. Returns `false` and leaves
/// `folders` untouched if `from` or `to_folder` does not exist.
pub fn move_across(folders: &mut [Folder], from: Cursor, to_folder: usize, insert: usize) -> bool {
    if to_folder >= folders.len() {
        return false;
    }
    let Some(source) = folders.get_mut(from.folder_index) else {
        return false;
    };
    if from.item_index >= source.children.len() {
        return false;
    }
    if from.folder_index == to_folder {
        return move_within(&mut source.children, from.item_index, insert);
    }

    let item = source.children.remove(from.item_index);
    let target = &mut folders[to_folder].children;
    let insert = insert.min(target.len());
    target.insert(insert, item);
    true
}

/// Suppresses remote structural updates during a local drag gesture.
///
/// Released `grace` after the gesture ends so the drop's own echo (or a
/// racing remote reorder) cannot clobber the optimistic local order.
#[derive(Debug, Clone)]
pub struct DragLock {
    dragging: bool,
    released_at: Option<Instant>,
    grace: Duration,
}

impl DragLock {
    pub fn new(grace: Duration) -> Self {
        Self {
            dragging: false,
            released_at: None,
            grace,
        }
    }

    pub fn begin(&mut self) {
        self.dragging = true;
        self.released_at = None;
    }

    pub fn end(&mut self, now: Instant) {
        if self.dragging {
            self.dragging = false;
            self.released_at = Some(now);
        }
    }

    pub fn is_held(&self, now: Instant) -> bool {
        self.dragging
            || self
                .released_at
                .is_some_and(|at| now.saturating_duration_since(at) < self.grace)
    }

    /// When a released lock stops holding. `None` while dragging or idle.
    pub fn release_deadline(&self) -> Option<Instant> {
        if self.dragging {
            return None;
        }
        self.released_at.map(|at| at + self.grace)
    }

    /// Forget any gesture, e.g. on detach.
    pub fn clear(&mut self) {
        self.dragging = false;
        self.released_at = None;
    }
}
