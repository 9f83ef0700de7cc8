use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["telemetry_service=info", "grid_client=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
