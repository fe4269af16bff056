use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins when set; otherwise both workspace crates log at info.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("energy_service=info,energy_client=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
