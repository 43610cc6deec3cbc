//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over `general.log_level`. Calling [`init`] more than
//! once (tests, embedding applications that already installed a
//! subscriber) is a no-op.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::GeneralConfig;

pub fn init(config: &GeneralConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let installed = if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    if installed.is_ok() {
        tracing::debug!(level = %config.log_level, json = config.json_logs, "logging initialized");
    }
}
