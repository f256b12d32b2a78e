//! Tracing / logging initialisation helpers.

use tonindex_core::indexer::LogConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives for `config`: `"info,tonindex_core::assembler=debug"` etc.
pub fn directives(config: &LogConfig) -> String {
    let mut directives = config.level.clone();
    let mut components: Vec<(String, &String)> = config
        .components
        .iter()
        .map(|(component, level)| (component.replace('-', "_"), level))
        .collect();
    components.sort();
    for (component, level) in components {
        directives.push_str(&format!(",{component}={level}"));
    }
    directives
}

/// Initialise tracing with the given log config.
/// Should be called once at application startup; later calls are ignored.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(directives(config)).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_overrides_are_normalised() {
        let mut config = LogConfig::default();
        config.components.insert("tonindex-core".into(), "debug".into());
        config.components.insert("tonindex_classify::rules".into(), "trace".into());
        assert_eq!(
            directives(&config),
            "info,tonindex_classify::rules=trace,tonindex_core=debug"
        );
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_tracing(&LogConfig::default());
        init_tracing(&LogConfig {
            json: true,
            ..LogConfig::default()
        });
    }
}
