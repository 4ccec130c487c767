pub mod apt;
pub mod args;
pub mod cache;
pub mod commands;
pub mod config;
pub mod mirror;

#[macro_use]
extern crate log;
