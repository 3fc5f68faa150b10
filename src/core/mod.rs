pub mod error;
pub mod flight;
pub mod value;

pub use error::{DacError, Result};
pub use flight::{OnceMap, SingleFlight};
pub use value::{FromValue, Json, ToValue, Value, ValueKind};
