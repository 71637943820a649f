pub mod cursor;
pub mod models;
pub mod store;

pub use cursor::{CursorStore, FileCursor};
pub use store::RecordStore;
