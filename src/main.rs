use healthdash::config::{AppConfig, LogFormat};
use healthdash::orchestrator::Orchestrator;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

#[tokio::main]
async fn main() {
    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(config.log_format);

    match Orchestrator::new(config).run().await {
        Ok(()) => {
            tracing::info!("healthdash shut down gracefully");
        }
        Err(e) => {
            tracing::error!(error = %e, "healthdash exited with error");
            std::process::exit(1);
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    match format {
        LogFormat::Json => {
            let collector = Registry::default()
                .with(tracing_subscriber::fmt::layer().json())
                .with(env_filter);
            tracing::subscriber::set_global_default(collector).expect("failed to set tracing subscriber");
        }
        LogFormat::Text => {
            let collector = Registry::default()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter);
            tracing::subscriber::set_global_default(collector).expect("failed to set tracing subscriber");
        }
    }
}
