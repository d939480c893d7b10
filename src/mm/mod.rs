//! Memory management: physical frames, address spaces, and the
//! kernel heap the rest of the kernel allocates from.

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod paging;

pub use address_space::{AddressSpace, SegmentExtents, VmRange};
