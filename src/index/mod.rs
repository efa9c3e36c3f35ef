pub mod source;
pub mod store;

pub use source::{FileSource, RecordSource};
pub use store::{IndexStore, SortCheck};
