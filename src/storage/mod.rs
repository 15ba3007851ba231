pub mod backend;
pub mod file;
pub mod memory;

pub use backend::KeyValueBackend;
pub use file::FileBackend;
pub use memory::MemoryBackend;
