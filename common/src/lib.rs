//! CoreBank Common Types
//!
//! Shared types used across the CoreBank ledger: identifiers, monetary
//! amounts, list queries and the error taxonomy.

pub mod error;
pub mod identifiers;
pub mod monetary;
pub mod query;
pub mod time;

pub use error::*;
pub use identifiers::*;
pub use monetary::*;
pub use query::*;
pub use time::*;
