pub mod error;
pub mod identifier;
pub mod value;

pub use error::{PersistenceError, Result};
pub use identifier::{EntityKey, Identifier};
pub use value::{DataType, Value};
