pub mod execution;
pub mod mention;
pub mod registry;
pub mod sessions;
