pub mod core;
pub mod export;
pub mod permission;
