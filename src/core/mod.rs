pub mod keyspace;
pub mod record;

pub use keyspace::*;
pub use record::*;
