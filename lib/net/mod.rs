//! Sandbox network identity allocation and virtual device management.

mod allocator;
mod tap;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use allocator::*;
pub use tap::*;
