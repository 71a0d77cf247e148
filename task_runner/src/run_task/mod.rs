mod core;
pub(crate) mod deps;
pub(crate) mod errors;
pub(crate) mod types;

pub use core::run_task;
