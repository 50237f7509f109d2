pub mod fetcher;
pub mod grouper;
pub mod sequence;
pub mod source;

pub use fetcher::{parse_body, Fetcher, HttpFetcher, MockFetcher};
pub use grouper::{DeduplicationGrouper, Group, Grouping};
pub use sequence::SequenceManager;
pub use source::{DraftChanges, PollOutcome, PollState, Source, SourceDraft};
