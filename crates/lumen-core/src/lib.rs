// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]

pub mod plugin;

pub use plugin::{DeclaredPlugin, Module, PluginError, PluginRecord, PluginRegistry};

/// Compact fmt subscriber filtered by `RUST_LOG`. Safe to call twice.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
