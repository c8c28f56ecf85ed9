pub mod memory;
pub mod segment;
pub mod traits;

pub use memory::MemoryBlockBuffer;
pub use segment::FileBlockBuffer;
pub use traits::BlockBuffer;
