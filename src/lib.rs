#[macro_use]
extern crate log;

pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod group;
pub mod ipc;
pub mod logger;
pub mod logtail;
pub mod pool;
pub mod process;
pub mod rpc;
pub mod states;
pub mod supervisor;

pub use miette::Result;
