pub mod cli;
pub mod executor;
pub mod protocol;
pub mod table;

pub use cli::{Command, prompt};
pub use executor::{MemoryExecutor, QueryError, QueryExecutor};
pub use table::{Table, TableError};
