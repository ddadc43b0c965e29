pub mod locks;
pub mod pool;
