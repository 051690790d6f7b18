pub mod comparator;
pub mod pattern;

pub use comparator::{Version, VersionComparator};
pub use pattern::VersionPattern;
