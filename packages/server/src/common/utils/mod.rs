pub mod hash;
pub mod url;

pub use hash::*;
pub use url::*;
