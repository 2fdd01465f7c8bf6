mod merge_review;
mod series;
mod source_link;

pub use merge_review::MergeReview;
pub use series::{NewSeries, Series};
pub use source_link::SeriesSource;
