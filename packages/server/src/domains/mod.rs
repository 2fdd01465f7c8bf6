// Domain modules. Business logic lives here; the kernel provides the
// execution infrastructure.

pub mod chapters;
pub mod series;
