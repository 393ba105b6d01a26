//! Result history and export

pub mod store;
