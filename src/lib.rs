pub mod core;
pub mod error;
pub mod models;
pub mod net;
pub mod storage;

#[cfg(test)]
mod testing;
