mod chapter_source;
mod logical_chapter;

pub use chapter_source::{ChapterSource, StoredSourceChapter};
pub use logical_chapter::LogicalChapter;
