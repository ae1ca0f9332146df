pub use anyhow::Result as Fallible;
pub use anyhow::{anyhow, bail, Context, Result};

pub use lazy_static::lazy_static;
pub use log::{debug, error, info, trace, warn};
pub use serde_derive::{Deserialize, Serialize};
