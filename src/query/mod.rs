//! Injection-safe query construction.
//!
//! - `builder`: fluent SELECT builder compiling to [`crate::models::Statement`]
//! - `identifier`: table/column name validation

pub mod builder;
pub mod identifier;

pub use builder::{Direction, Operator, QueryBuilder};
pub use identifier::{is_valid_identifier, is_valid_select_field};
