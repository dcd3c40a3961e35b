use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

use tracing::Level;
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// Read a knob override from the environment, falling back to `default` when
/// the variable is unset or unparseable.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Call once at service startup. `RUST_LOG` refines the filter.
pub fn config_service() {
    let format_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::env::var("NO_COLOR").is_err())
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(Level::INFO.as_str())),
        );
    tracing_subscriber::registry().with(format_layer).init();
}
