#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "meme_audio=info,backend=info,fetch_audio=info";

/// Installs the fmt subscriber. `RUST_LOG` overrides the default filter.
/// Calling it twice is harmless; the second install is ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("still alive");
    }
}
