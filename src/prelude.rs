//! Re-exports the traits needed to use the adapter.

pub use crate::os_mutex::Kernel as _;
pub use crate::Driver as _;
pub use crate::RawFlash as _;
