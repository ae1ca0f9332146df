use crate::prelude::*;
use std::env;
use std::path::PathBuf;

lazy_static! {
    pub static ref WORK_DIR: PathBuf = env::var_os("LUPA_WORK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| "./work".into());

    // L3 cache payloads, one file per fingerprint
    pub static ref CACHE_DIR: PathBuf = WORK_DIR.join("cache");
}
