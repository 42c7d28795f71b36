pub mod document;
pub mod operation;

pub use document::{Applied, ApplyError, Document, DocumentStats};
pub use operation::{encoded_len, Operation, Point, Stroke, StrokeFragment, StrokeId, UserId, ValidationError};
