pub mod dead_letter;
pub mod store_sink;

pub use dead_letter::{DeadLetter, DeadLetterSink, FileDeadLetterSink, MemoryDeadLetterSink};
pub use store_sink::{StoreSink, StoreSinkSettings};
