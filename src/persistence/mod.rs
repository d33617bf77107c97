// Durable agent activity journal
pub mod journal;

pub use journal::{JournalEntry, JournalEntryType, JournalStore, JournalWriter};
