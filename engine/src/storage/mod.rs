pub mod pool;

pub use pool::{FileMode, FilePool, PoolError};
