use observability_querier::{api, config::QuerierConfig, logging};

#[tokio::main]
async fn main() {
    let config = match QuerierConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_logger(&config.logging) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = api::serve(config).await {
        tracing::error!("Querier stopped: {}", e);
        std::process::exit(1);
    }
}
