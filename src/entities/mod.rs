// Entity Models
//
// Each workspace holds one tree: books → chapters → verses.
// - Books carry a stable legacy id that NEVER changes once assigned
// - Chapters and verses are keyed by number within their parent

pub mod book;
pub mod verse;

pub use book::{BookCatalog, BookRecord, BookSpec, Grouping};
pub use verse::{ChapterContent, ChapterToken, VerseRecord, Workspace, LETTERED_CHAPTER_BASE};
