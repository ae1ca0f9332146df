#[macro_use]
pub mod utils;

pub mod cache;
pub mod config;
pub mod db;
pub mod dirs;
pub mod errors;
pub mod events;
pub mod federation;
pub mod investigations;
pub mod llm;
pub mod orchestrator;
pub mod planner;
mod prelude;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod workers;

use crate::prelude::*;

pub static GIT_REVISION: Option<&str> = include!(concat!(env!("OUT_DIR"), "/sha"));

lazy_static! {
    pub(crate) static ref USER_AGENT: String = format!(
        "lupa/{}{}",
        env!("CARGO_PKG_VERSION"),
        match GIT_REVISION {
            Some(rev) => format!(" ({rev})"),
            None => String::new(),
        }
    );
}
