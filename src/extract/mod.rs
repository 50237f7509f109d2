/// Term search over parsed response trees
pub mod value_extractor;

/// Numeric coercion and display formatting
pub mod format;

pub use format::{coerce, format_float, format_number, truncate_display, DISPLAY_CAP, MAX_DECIMALS};
pub use value_extractor::{extract, MAX_DEPTH};
