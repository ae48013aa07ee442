pub mod comm;
pub mod logging;
