use crate::config::Settings;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Inicjalizacja logowania z ustawień: poziom + format (tekst albo JSON).
/// `try_init` zamiast `init` – drugi start (np. w testach) nie ma prawa panikować.
pub fn init(settings: &Settings) {
    let level = settings
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "info".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if settings.logging.json.unwrap_or(false) {
        let _ = registry
            .with(fmt::layer().json().with_target(true))
            .try_init();
    } else {
        let _ = registry.with(fmt::layer().with_target(true)).try_init();
    }
}
