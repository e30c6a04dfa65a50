use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directive applied on top of `RUST_LOG`
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "jobwatch=debug"
    } else {
        "jobwatch=info"
    }
}

/// Installs the global subscriber, writing to stderr so stdout stays the view
pub fn init_logging(verbose: bool) {
    let filter = match default_directive(verbose).parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init();
}
