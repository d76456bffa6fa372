//! Typed in-memory forms of every on-disk structure, each with a pure
//! `marshal`/`unmarshal` pair.

pub mod bat;
pub mod batmap;
pub mod bitmap;
pub mod footer;
pub mod header;

pub use bat::Bat;
pub use batmap::Batmap;
pub use bitmap::Bitmap;
pub use footer::{CreatorHostOs, DiskType, Footer};
pub use header::{ParentLocator, SparseHeader};
