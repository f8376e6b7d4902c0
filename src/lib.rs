pub mod config;
pub mod ipc;
pub mod profile;
pub mod resource;
pub mod supervisor;
