pub use log::{debug, error, info, trace, warn};

pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::error::{Error, FrameError, Result};
pub use crate::sma::{self, address::MacAddress};
pub use crate::transport::Transport;
pub use crate::utils::Utils;

pub use std::str::FromStr;
pub use std::time::Duration;
