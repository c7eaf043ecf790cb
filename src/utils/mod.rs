pub mod stats;
pub mod testing;
