use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub type StrokeId = String;
pub type UserId = String;

/// Longest accepted stroke or user id.
pub const MAX_ID_LEN: usize = 64;
pub const MAX_COLOR_LEN: usize = 32;
pub const MAX_WIDTH: f64 = 200.0;
/// Upper bound on points carried by one client message.
pub const MAX_POINTS_PER_MESSAGE: usize = 1_000;
/// Upper bound on the index of any point in a stroke.
pub const MAX_STROKE_POINTS: u32 = 10_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, ToSchema)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A stroke as seen by clients and as carried by `insert` operations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: StrokeId,
    pub user_id: UserId,
    pub color: String,
    pub width: f64,
    pub points: Vec<Point>,
    #[serde(default)]
    pub finalized: bool,
    pub op_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// The part of a stroke carried by one `draw` broadcast.
///
/// `points` start at index `start` within the stroke.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrokeFragment {
    pub id: StrokeId,
    pub user_id: UserId,
    pub color: String,
    pub width: f64,
    pub start: u32,
    pub points: Vec<Point>,
    pub finalized: bool,
}

/// A replicated document operation.
///
/// Every variant is idempotent and commutes with every other variant, which is
/// what lets replicas apply relayed operations in whatever order the broker
/// delivers them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    Insert {
        stroke: Stroke,
    },
    #[serde(rename_all = "camelCase")]
    Append {
        stroke_id: StrokeId,
        start: u32,
        points: Vec<Point>,
    },
    #[serde(rename_all = "camelCase")]
    Finalize {
        stroke_id: StrokeId,
        len: u32,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        stroke_ids: Vec<StrokeId>,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("id must be 1 to 64 printable characters")]
    InvalidId,
    #[error("color must be 1 to 32 characters")]
    InvalidColor,
    #[error("width must be in (0, 200]")]
    InvalidWidth,
    #[error("point coordinates must be finite")]
    NonFinitePoint,
    #[error("too many points: {0}")]
    TooManyPoints(usize),
}

pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.len() > MAX_ID_LEN || id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidId);
    }
    Ok(())
}

pub fn validate_style(color: &str, width: f64) -> Result<(), ValidationError> {
    if color.is_empty() || color.len() > MAX_COLOR_LEN {
        return Err(ValidationError::InvalidColor);
    }
    if !(width > 0.0 && width <= MAX_WIDTH) {
        return Err(ValidationError::InvalidWidth);
    }
    Ok(())
}

pub fn validate_points(points: &[Point], max: usize) -> Result<(), ValidationError> {
    if points.len() > max {
        return Err(ValidationError::TooManyPoints(points.len()));
    }
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(ValidationError::NonFinitePoint);
    }
    Ok(())
}

impl Operation {
    /// Reject structurally invalid operations before they reach a document.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Operation::Insert { stroke } => {
                validate_id(&stroke.id)?;
                validate_id(&stroke.user_id)?;
                validate_style(&stroke.color, stroke.width)?;
                validate_points(&stroke.points, MAX_STROKE_POINTS as usize)
            }
            Operation::Append { stroke_id, start, points } => {
                validate_id(stroke_id)?;
                let end = *start as usize + points.len();
                if end > MAX_STROKE_POINTS as usize {
                    return Err(ValidationError::TooManyPoints(end));
                }
                validate_points(points, MAX_STROKE_POINTS as usize)
            }
            Operation::Finalize { stroke_id, len } => {
                validate_id(stroke_id)?;
                if *len > MAX_STROKE_POINTS {
                    return Err(ValidationError::TooManyPoints(*len as usize));
                }
                Ok(())
            }
            Operation::Delete { stroke_ids } => stroke_ids.iter().try_for_each(|id| validate_id(id)),
        }
    }

    /// Split an operation into pieces whose encoding fits in `budget` bytes.
    ///
    /// Each piece is a valid operation on its own, so the pieces may be applied
    /// in any order. A single point or id larger than the budget still gets a
    /// piece of its own.
    pub fn chunked(self, budget: usize) -> Vec<Operation> {
        match self {
            Operation::Insert { mut stroke } => {
                let points = std::mem::take(&mut stroke.points);
                let finalized = stroke.finalized;

                // The head insert must not finalize before the tail lands
                stroke.finalized = false;
                let overhead = encoded_len(&Operation::Insert { stroke: stroke.clone() }).max(encoded_len(
                    &Operation::Append { stroke_id: stroke.id.clone(), start: MAX_STROKE_POINTS, points: Vec::new() },
                ));
                let runs = pack(&points, budget.saturating_sub(overhead));
                if runs.len() <= 1 {
                    stroke.points = points;
                    stroke.finalized = finalized;
                    return vec![Operation::Insert { stroke }];
                }

                let stroke_id = stroke.id.clone();
                let mut ops = Vec::with_capacity(runs.len() + 1);
                let mut start = 0u32;
                for run in runs {
                    if start == 0 {
                        stroke.points = run.to_vec();
                        ops.push(Operation::Insert { stroke: stroke.clone() });
                    } else {
                        ops.push(Operation::Append { stroke_id: stroke_id.clone(), start, points: run.to_vec() });
                    }
                    start += run.len() as u32;
                }
                if finalized {
                    ops.push(Operation::Finalize { stroke_id, len: start });
                }
                ops
            }
            Operation::Append { stroke_id, start, points } => {
                let overhead = encoded_len(&Operation::Append {
                    stroke_id: stroke_id.clone(),
                    start: MAX_STROKE_POINTS,
                    points: Vec::new(),
                });
                let mut offset = start;
                let mut ops = Vec::new();
                for run in pack(&points, budget.saturating_sub(overhead)) {
                    ops.push(Operation::Append { stroke_id: stroke_id.clone(), start: offset, points: run.to_vec() });
                    offset += run.len() as u32;
                }
                if ops.is_empty() {
                    ops.push(Operation::Append { stroke_id, start, points });
                }
                ops
            }
            Operation::Delete { stroke_ids } => {
                let overhead = encoded_len(&Operation::Delete { stroke_ids: Vec::new() });
                let runs = pack(&stroke_ids, budget.saturating_sub(overhead));
                if runs.len() <= 1 {
                    return vec![Operation::Delete { stroke_ids }];
                }
                runs.into_iter()
                    .map(|run| Operation::Delete { stroke_ids: run.to_vec() })
                    .collect()
            }
            op => vec![op],
        }
    }
}

/// Size of the JSON encoding of `value`, in bytes.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(usize::MAX, |bytes| bytes.len())
}

/// Split `items` into runs whose encodings, separators included, add up to at
/// most `budget` bytes. Every run holds at least one item.
pub fn pack<T: Serialize>(items: &[T], budget: usize) -> Vec<&[T]> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut used = 0usize;
    for (i, item) in items.iter().enumerate() {
        let size = encoded_len(item).saturating_add(1);
        if i > start && used.saturating_add(size) > budget {
            runs.push(&items[start..i]);
            start = i;
            used = 0;
        }
        used = used.saturating_add(size);
    }
    if start < items.len() {
        runs.push(&items[start..]);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke(id: &str, n: usize) -> Stroke {
        Stroke {
            id: id.to_string(),
            user_id: "u1".to_string(),
            color: "#000".to_string(),
            width: 2.0,
            points: (0..n).map(|i| Point { x: i as f64, y: 0.0 }).collect(),
            finalized: true,
            op_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn operation_wire_format_uses_op_tag() {
        let op = Operation::Finalize { stroke_id: "s1".into(), len: 3 };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, serde_json::json!({"op": "finalize", "strokeId": "s1", "len": 3}));
    }

    #[test]
    fn large_insert_is_split_into_insert_appends_and_finalize() {
        let ops = Operation::Insert { stroke: stroke("s1", 450) }.chunked(2_000);
        assert!(ops.len() > 3);
        match &ops[0] {
            Operation::Insert { stroke } => assert!(!stroke.finalized),
            other => panic!("unexpected {other:?}"),
        }

        let mut next = 0;
        for op in &ops {
            assert!(encoded_len(op) <= 2_000, "{} bytes", encoded_len(op));
            match op {
                Operation::Insert { stroke } => next += stroke.points.len() as u32,
                Operation::Append { start, points, .. } => {
                    assert_eq!(*start, next);
                    next += points.len() as u32;
                }
                _ => {}
            }
        }
        assert_eq!(next, 450);
        assert_eq!(ops.last(), Some(&Operation::Finalize { stroke_id: "s1".into(), len: 450 }));
    }

    #[test]
    fn small_operations_are_left_whole() {
        let insert = Operation::Insert { stroke: stroke("s1", 3) };
        assert_eq!(insert.clone().chunked(2_000), vec![insert]);
        let finalize = Operation::Finalize { stroke_id: "s1".into(), len: 3 };
        assert_eq!(finalize.clone().chunked(10), vec![finalize]);
    }

    #[test]
    fn delete_lists_are_chunked_by_encoded_size() {
        // Quotes double in size once escaped
        let ids: Vec<StrokeId> = (0..250).map(|i| format!("{i:0>3}{}", "\"".repeat(61))).collect();
        let ops = Operation::Delete { stroke_ids: ids }.chunked(4_000);
        assert!(ops.len() > 1);
        let mut total = 0;
        for op in &ops {
            assert!(encoded_len(op) <= 4_000);
            if let Operation::Delete { stroke_ids } = op {
                total += stroke_ids.len();
            }
        }
        assert_eq!(total, 250);
    }

    #[test]
    fn pack_keeps_oversized_items_alone() {
        let items = vec!["a".repeat(10), "b".to_string(), "c".to_string()];
        let runs = pack(&items, 8);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], &items[..1]);
        assert_eq!(runs[1], &items[1..]);
    }

    #[test]
    fn validation_rejects_bad_ids_and_points() {
        assert_eq!(validate_id(""), Err(ValidationError::InvalidId));
        assert_eq!(validate_id(&"x".repeat(65)), Err(ValidationError::InvalidId));
        assert!(validate_id("stroke-1").is_ok());
        assert_eq!(validate_style("#fff", 0.0), Err(ValidationError::InvalidWidth));
        assert_eq!(
            validate_points(&[Point { x: f64::NAN, y: 1.0 }], 10),
            Err(ValidationError::NonFinitePoint)
        );
        let op = Operation::Append { stroke_id: "s".into(), start: MAX_STROKE_POINTS, points: vec![Point { x: 0.0, y: 0.0 }] };
        assert!(op.validate().is_err());
    }
}
