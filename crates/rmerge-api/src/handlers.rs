//! Request handlers.

pub mod health;
pub mod ledger;
pub mod merge;

pub use health::*;
pub use ledger::*;
pub use merge::*;
