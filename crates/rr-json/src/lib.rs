//! Small, dependency-light JSON and byte-size helpers shared by configuration loading
//! across the rest of this workspace.

mod bytes;
mod editor;
mod merge;

pub use bytes::{parse_bytes, BytesParseError};
pub use editor::{apply_directives, EditorError};
pub use merge::merge;
