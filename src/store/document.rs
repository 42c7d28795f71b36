//! Replicated stroke document.
//!
//! The document is a grow-only map of strokes plus a grow-only tombstone set.
//! Points are keyed by their index inside the stroke so appends commute, and a
//! stroke is visible iff it has been inserted and its id is not tombstoned.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::operation::{Operation, Point, Stroke, StrokeFragment, StrokeId, UserId, MAX_STROKE_POINTS};

/// Default bound on strokes whose appends arrived before their insert.
pub const DEFAULT_MAX_PENDING_STROKES: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error("stroke '{0}' is deleted")]
    Tombstoned(StrokeId),
    #[error("stroke '{0}' is finalized")]
    Finalized(StrokeId),
    #[error("stroke '{0}' would exceed the point limit")]
    TooManyPoints(StrokeId),
    #[error("pending buffer full, dropping early points for stroke '{0}'")]
    PendingFull(StrokeId),
}

/// What changed when an operation was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Inserted(StrokeFragment),
    Appended(StrokeFragment),
    Finalized(StrokeFragment),
    /// Ids newly tombstoned that were visible before.
    Deleted(Vec<StrokeId>),
    /// The target stroke is not known yet; the points wait for its insert.
    Buffered,
    Unchanged,
}

impl Applied {
    pub fn is_change(&self) -> bool {
        !matches!(self, Applied::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentStats {
    pub visible: usize,
    pub tombstones: usize,
    pub pending: usize,
}

#[derive(Debug, Clone)]
struct StrokeEntry {
    user_id: UserId,
    color: String,
    width: f64,
    op_id: Uuid,
    created_at: DateTime<Utc>,
    points: BTreeMap<u32, Point>,
    final_len: Option<u32>,
}

impl StrokeEntry {
    fn visible_points(&self) -> impl Iterator<Item = &Point> {
        let end = self.final_len.unwrap_or(u32::MAX);
        self.points.range(..end).map(|(_, p)| p)
    }

    fn to_stroke(&self, id: &str) -> Stroke {
        Stroke {
            id: id.to_string(),
            user_id: self.user_id.clone(),
            color: self.color.clone(),
            width: self.width,
            points: self.visible_points().copied().collect(),
            finalized: self.final_len.is_some(),
            op_id: self.op_id,
            created_at: self.created_at,
        }
    }

    fn fragment(&self, id: &str, start: u32, points: Vec<Point>) -> StrokeFragment {
        StrokeFragment {
            id: id.to_string(),
            user_id: self.user_id.clone(),
            color: self.color.clone(),
            width: self.width,
            start,
            points,
            finalized: self.final_len.is_some(),
        }
    }

    /// Insert indexed points, ignoring indexes already present or past the final length.
    /// Returns how many points were new.
    fn merge_points(&mut self, start: u32, points: &[Point]) -> usize {
        let end = self.final_len.unwrap_or(MAX_STROKE_POINTS);
        let mut added = 0;
        for (offset, point) in points.iter().enumerate() {
            let index = start + offset as u32;
            if index >= end {
                break;
            }
            if let std::collections::btree_map::Entry::Vacant(slot) = self.points.entry(index) {
                slot.insert(*point);
                added += 1;
            }
        }
        added
    }

    fn finalize(&mut self, len: u32) -> bool {
        let len = self.final_len.map_or(len, |current| current.min(len));
        if self.final_len == Some(len) {
            return false;
        }
        self.final_len = Some(len);
        true
    }
}

/// Points and final length received for a stroke before its insert.
#[derive(Debug, Clone, Default)]
struct PendingStroke {
    points: BTreeMap<u32, Point>,
    final_len: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Document {
    strokes: HashMap<StrokeId, StrokeEntry>,
    tombstones: HashSet<StrokeId>,
    pending: HashMap<StrokeId, PendingStroke>,
    max_pending: usize,
    version: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::with_pending_limit(DEFAULT_MAX_PENDING_STROKES)
    }

    pub fn with_pending_limit(max_pending: usize) -> Self {
        Self {
            strokes: HashMap::new(),
            tombstones: HashSet::new(),
            pending: HashMap::new(),
            max_pending,
            version: 0,
        }
    }

    /// Local change counter. Not replicated; two converged replicas may differ here.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, id: &str) -> bool {
        self.strokes.contains_key(id)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    /// Index the next appended point of a stroke should take.
    pub fn next_index(&self, id: &str) -> u32 {
        self.strokes
            .get(id)
            .and_then(|entry| entry.points.keys().next_back())
            .map_or(0, |last| last + 1)
    }

    pub fn stroke(&self, id: &str) -> Option<Stroke> {
        if self.tombstones.contains(id) {
            return None;
        }
        self.strokes.get(id).map(|entry| entry.to_stroke(id))
    }

    pub fn stats(&self) -> DocumentStats {
        DocumentStats {
            visible: self.strokes.len(),
            tombstones: self.tombstones.len(),
            pending: self.pending.len(),
        }
    }

    /// All visible strokes, ordered by creation time then id.
    pub fn snapshot(&self) -> Vec<Stroke> {
        let mut strokes: Vec<Stroke> = self
            .strokes
            .iter()
            .map(|(id, entry)| entry.to_stroke(id))
            .collect();
        strokes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        strokes
    }

    /// Ids of the visible strokes owned by `user_id`, sorted.
    pub fn owned_by(&self, user_id: &str) -> Vec<StrokeId> {
        let mut ids: Vec<StrokeId> = self
            .strokes
            .iter()
            .filter(|(_, entry)| entry.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Tombstone every visible stroke owned by `user_id`.
    ///
    /// The read of the owned set and the tombstoning happen under the same
    /// `&mut self`, so nothing can slip in between. The returned ids are what
    /// must be broadcast; the user-level command itself never leaves the node.
    pub fn delete_by_user(&mut self, user_id: &str) -> Vec<StrokeId> {
        let ids = self.owned_by(user_id);
        if self.tombstone_all(&ids).is_some() {
            self.version += 1;
        }
        ids
    }

    /// Tombstone every visible stroke and return their ids.
    pub fn clear_all(&mut self) -> Vec<StrokeId> {
        let mut ids: Vec<StrokeId> = self.strokes.keys().cloned().collect();
        ids.sort();
        if self.tombstone_all(&ids).is_some() {
            self.version += 1;
        }
        ids
    }

    pub fn apply(&mut self, op: &Operation) -> Result<Applied, ApplyError> {
        let applied = match op {
            Operation::Insert { stroke } => self.insert(stroke),
            Operation::Append { stroke_id, start, points } => self.append(stroke_id, *start, points)?,
            Operation::Finalize { stroke_id, len } => self.finalize(stroke_id, *len)?,
            Operation::Delete { stroke_ids } => match self.tombstone_all(stroke_ids) {
                Some(hidden) => Applied::Deleted(hidden),
                None => Applied::Unchanged,
            },
        };
        if applied.is_change() {
            self.version += 1;
        }
        Ok(applied)
    }

    fn insert(&mut self, stroke: &Stroke) -> Applied {
        if self.tombstones.contains(&stroke.id) || self.strokes.contains_key(&stroke.id) {
            debug!("Ignoring insert of known stroke {}", stroke.id);
            return Applied::Unchanged;
        }

        let mut entry = StrokeEntry {
            user_id: stroke.user_id.clone(),
            color: stroke.color.clone(),
            width: stroke.width,
            op_id: stroke.op_id,
            created_at: stroke.created_at,
            points: BTreeMap::new(),
            final_len: None,
        };
        entry.merge_points(0, &stroke.points);
        if stroke.finalized {
            entry.finalize(stroke.points.len() as u32);
        }

        // Appends that raced ahead of this insert
        if let Some(pending) = self.pending.remove(&stroke.id) {
            if let Some(len) = pending.final_len {
                entry.finalize(len);
            }
            for (index, point) in pending.points {
                entry.merge_points(index, &[point]);
            }
        }

        let points = entry.visible_points().copied().collect();
        let fragment = entry.fragment(&stroke.id, 0, points);
        self.strokes.insert(stroke.id.clone(), entry);
        Applied::Inserted(fragment)
    }

    fn append(&mut self, id: &str, start: u32, points: &[Point]) -> Result<Applied, ApplyError> {
        if self.tombstones.contains(id) {
            return Err(ApplyError::Tombstoned(id.to_string()));
        }
        if start as usize + points.len() > MAX_STROKE_POINTS as usize {
            return Err(ApplyError::TooManyPoints(id.to_string()));
        }

        let Some(entry) = self.strokes.get_mut(id) else {
            let pending = self.pending_entry(id)?;
            for (offset, point) in points.iter().enumerate() {
                pending.points.entry(start + offset as u32).or_insert(*point);
            }
            return Ok(Applied::Buffered);
        };

        let mut accepted = points;
        if let Some(len) = entry.final_len {
            if start >= len {
                return Err(ApplyError::Finalized(id.to_string()));
            }
            accepted = &points[..points.len().min((len - start) as usize)];
        }

        if entry.merge_points(start, accepted) == 0 {
            return Ok(Applied::Unchanged);
        }
        Ok(Applied::Appended(entry.fragment(id, start, accepted.to_vec())))
    }

    fn finalize(&mut self, id: &str, len: u32) -> Result<Applied, ApplyError> {
        if self.tombstones.contains(id) {
            return Err(ApplyError::Tombstoned(id.to_string()));
        }

        let Some(entry) = self.strokes.get_mut(id) else {
            let pending = self.pending_entry(id)?;
            pending.final_len = Some(pending.final_len.map_or(len, |current| current.min(len)));
            return Ok(Applied::Buffered);
        };

        if !entry.finalize(len) {
            return Ok(Applied::Unchanged);
        }
        Ok(Applied::Finalized(entry.fragment(id, len, Vec::new())))
    }

    fn pending_entry(&mut self, id: &str) -> Result<&mut PendingStroke, ApplyError> {
        if !self.pending.contains_key(id) && self.pending.len() >= self.max_pending {
            warn!("Pending buffer full ({} strokes), dropping points for {}", self.max_pending, id);
            return Err(ApplyError::PendingFull(id.to_string()));
        }
        Ok(self.pending.entry(id.to_string()).or_default())
    }

    /// Returns `None` when no id was newly tombstoned, otherwise the ids that were visible.
    fn tombstone_all(&mut self, ids: &[StrokeId]) -> Option<Vec<StrokeId>> {
        let mut changed = false;
        let mut hidden = Vec::new();
        for id in ids {
            if !self.tombstones.insert(id.clone()) {
                continue;
            }
            changed = true;
            self.pending.remove(id);
            if self.strokes.remove(id).is_some() {
                hidden.push(id.clone());
            }
        }
        changed.then_some(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke(id: &str, user: &str, points: usize, finalized: bool) -> Stroke {
        Stroke {
            id: id.to_string(),
            user_id: user.to_string(),
            color: "#222222".to_string(),
            width: 3.0,
            points: (0..points).map(|i| Point { x: i as f64, y: i as f64 * 2.0 }).collect(),
            finalized,
            op_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    fn pt(x: f64) -> Point {
        Point { x, y: 0.0 }
    }

    #[test]
    fn insert_is_idempotent() {
        let mut doc = Document::new();
        let s = stroke("s1", "u1", 2, false);
        assert!(matches!(doc.apply(&Operation::Insert { stroke: s.clone() }), Ok(Applied::Inserted(_))));
        assert_eq!(doc.apply(&Operation::Insert { stroke: s }), Ok(Applied::Unchanged));
        assert_eq!(doc.snapshot().len(), 1);
    }

    #[test]
    fn insert_never_overwrites_existing_stroke() {
        let mut doc = Document::new();
        let first = stroke("s1", "u1", 2, false);
        let mut second = stroke("s1", "u2", 5, true);
        second.color = "#ff0000".into();
        doc.apply(&Operation::Insert { stroke: first.clone() }).unwrap();
        doc.apply(&Operation::Insert { stroke: second }).unwrap();
        let current = doc.stroke("s1").unwrap();
        assert_eq!(current.user_id, "u1");
        assert_eq!(current.points, first.points);
    }

    #[test]
    fn delete_before_insert_wins() {
        let mut doc = Document::new();
        let delete = Operation::Delete { stroke_ids: vec!["s1".into()] };
        assert_eq!(doc.apply(&delete), Ok(Applied::Deleted(vec![])));
        assert_eq!(doc.apply(&Operation::Insert { stroke: stroke("s1", "u1", 1, true) }), Ok(Applied::Unchanged));
        assert!(doc.snapshot().is_empty());
        assert!(doc.is_tombstoned("s1"));
        assert_eq!(doc.apply(&delete), Ok(Applied::Unchanged));
    }

    #[test]
    fn append_before_insert_is_buffered_then_merged() {
        let mut doc = Document::new();
        let append = Operation::Append { stroke_id: "s1".into(), start: 2, points: vec![pt(9.0), pt(10.0)] };
        assert_eq!(doc.apply(&append), Ok(Applied::Buffered));
        assert_eq!(doc.stats().pending, 1);

        doc.apply(&Operation::Insert { stroke: stroke("s1", "u1", 2, false) }).unwrap();
        let s = doc.stroke("s1").unwrap();
        assert_eq!(s.points.len(), 4);
        assert_eq!(s.points[3], pt(10.0));
        assert_eq!(doc.stats().pending, 0);
    }

    #[test]
    fn append_to_tombstoned_stroke_is_rejected_without_side_effects() {
        let mut doc = Document::new();
        doc.apply(&Operation::Insert { stroke: stroke("s1", "u1", 1, false) }).unwrap();
        doc.apply(&Operation::Delete { stroke_ids: vec!["s1".into()] }).unwrap();
        let version = doc.version();
        let append = Operation::Append { stroke_id: "s1".into(), start: 1, points: vec![pt(1.0)] };
        assert_eq!(doc.apply(&append), Err(ApplyError::Tombstoned("s1".into())));
        assert_eq!(doc.version(), version);
        assert_eq!(doc.stats().pending, 0);
    }

    #[test]
    fn duplicate_append_changes_nothing() {
        let mut doc = Document::new();
        doc.apply(&Operation::Insert { stroke: stroke("s1", "u1", 1, false) }).unwrap();
        let append = Operation::Append { stroke_id: "s1".into(), start: 1, points: vec![pt(5.0)] };
        assert!(matches!(doc.apply(&append), Ok(Applied::Appended(_))));
        let before = doc.snapshot();
        assert_eq!(doc.apply(&append), Ok(Applied::Unchanged));
        assert_eq!(doc.snapshot(), before);
    }

    #[test]
    fn finalize_rejects_later_points_but_accepts_reordered_earlier_ones() {
        let mut doc = Document::new();
        doc.apply(&Operation::Insert { stroke: stroke("s1", "u1", 1, false) }).unwrap();
        doc.apply(&Operation::Finalize { stroke_id: "s1".into(), len: 3 }).unwrap();

        // Index 1..3 was in flight when the finalize overtook it
        let late = Operation::Append { stroke_id: "s1".into(), start: 1, points: vec![pt(1.0), pt(2.0)] };
        assert!(matches!(doc.apply(&late), Ok(Applied::Appended(_))));

        let beyond = Operation::Append { stroke_id: "s1".into(), start: 3, points: vec![pt(3.0)] };
        assert_eq!(doc.apply(&beyond), Err(ApplyError::Finalized("s1".into())));

        let s = doc.stroke("s1").unwrap();
        assert!(s.finalized);
        assert_eq!(s.points.len(), 3);
    }

    #[test]
    fn finalize_keeps_the_smaller_length() {
        let mut doc = Document::new();
        doc.apply(&Operation::Insert { stroke: stroke("s1", "u1", 4, false) }).unwrap();
        doc.apply(&Operation::Finalize { stroke_id: "s1".into(), len: 3 }).unwrap();
        assert_eq!(doc.apply(&Operation::Finalize { stroke_id: "s1".into(), len: 4 }), Ok(Applied::Unchanged));
        assert_eq!(doc.stroke("s1").unwrap().points.len(), 3);
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let mut doc = Document::with_pending_limit(1);
        let a = Operation::Append { stroke_id: "a".into(), start: 1, points: vec![pt(1.0)] };
        let b = Operation::Append { stroke_id: "b".into(), start: 1, points: vec![pt(1.0)] };
        assert_eq!(doc.apply(&a), Ok(Applied::Buffered));
        assert_eq!(doc.apply(&b), Err(ApplyError::PendingFull("b".into())));
        // The already buffered stroke still accepts more points
        let a2 = Operation::Append { stroke_id: "a".into(), start: 2, points: vec![pt(2.0)] };
        assert_eq!(doc.apply(&a2), Ok(Applied::Buffered));
    }

    #[test]
    fn delete_by_user_returns_concrete_ids_and_spares_others() {
        let mut doc = Document::new();
        for (id, user) in [("a", "u1"), ("b", "u2"), ("c", "u1")] {
            doc.apply(&Operation::Insert { stroke: stroke(id, user, 1, true) }).unwrap();
        }
        let ids = doc.delete_by_user("u1");
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
        let left: Vec<_> = doc.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(left, vec!["b".to_string()]);
        assert!(doc.delete_by_user("u1").is_empty());
    }

    #[test]
    fn clear_all_tombstones_everything_visible() {
        let mut doc = Document::new();
        doc.apply(&Operation::Insert { stroke: stroke("a", "u1", 1, true) }).unwrap();
        doc.apply(&Operation::Insert { stroke: stroke("b", "u2", 1, true) }).unwrap();
        assert_eq!(doc.clear_all().len(), 2);
        assert!(doc.snapshot().is_empty());
        assert_eq!(doc.stats().tombstones, 2);
    }

    #[test]
    fn next_index_follows_the_last_point() {
        let mut doc = Document::new();
        assert_eq!(doc.next_index("s1"), 0);
        doc.apply(&Operation::Insert { stroke: stroke("s1", "u1", 3, false) }).unwrap();
        assert_eq!(doc.next_index("s1"), 3);
    }
}
