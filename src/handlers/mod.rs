pub mod board;
pub mod diagnostics;
pub mod health;

pub use board::*;
pub use diagnostics::*;
pub use health::*;
