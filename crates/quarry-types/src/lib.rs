//! Shared value types for the Quarry database engine.
//!
//! This crate holds the types that cross the boundary between application
//! code and the engine: [`Value`], the dynamically typed cell used for both
//! statement arguments and scanned results, and [`ValidationErrors`], the
//! field-keyed failure collection returned when a write is vetoed.
//!
//! It deliberately has no knowledge of connections, dialects or drivers so
//! that model definitions can depend on it without pulling in the engine.

mod validation;
mod value;

pub use validation::ValidationErrors;
pub use value::Value;

/// Builds a `Vec<Value>` from a list of expressions convertible into [`Value`].
///
/// ```
/// use quarry_types::{args, Value};
///
/// let args = args![1, "two", 3.0];
/// assert_eq!(args[1], Value::Text("two".into()));
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($arg)),+]
    };
}
