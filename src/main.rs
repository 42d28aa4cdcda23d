use rcs_ims::application::{ImsModule, ImsServices, UserProfile};
use rcs_ims::config::Config;
use rcs_ims::domain::presence::Registry;
use rcs_ims::domain::shared::{EventBus, LoggingListener};
use rcs_ims::infrastructure::metrics;
use rcs_ims::infrastructure::persistence::{
    FileRegistry, MemoryContactStore, MemoryMessageHistory, MemoryRegistry,
};
use rcs_ims::infrastructure::protocols::sip::{TransactionLayer, UdpTransport};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Args {
    config: Option<String>,
    print_config: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        print_config: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                args.config = Some(
                    iter.next()
                        .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?,
                );
            }
            "--print-config" => args.print_config = true,
            other => anyhow::bail!("Unknown argument {}", other),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    if args.print_config {
        println!("{}", toml::to_string_pretty(&Config::default())?);
        return Ok(());
    }

    info!("Starting rcs-ims {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Arc::new(Config::load(args.config.as_deref())?);
    info!("Configuration loaded for {}", config.ims.public_uri());

    if let Some(listen) = &config.metrics.listen {
        metrics::init_metrics(listen.parse()?)?;
    }

    let (transport, incoming) = UdpTransport::bind(config.bind_addr()?).await?;
    let transactions = TransactionLayer::new(
        transport.clone(),
        config.outbound_proxy()?,
        config.transaction_timeout(),
        config.invite_timeout(),
    );

    let registry: Arc<dyn Registry> = match &config.registry.path {
        Some(path) => Arc::new(FileRegistry::open(path)),
        None => Arc::new(MemoryRegistry::new()),
    };
    let events = Arc::new(EventBus::new());
    events.add_listener(Arc::new(LoggingListener)).await;

    let services = ImsServices::new(
        transactions,
        UserProfile::from_config(&config),
        Arc::new(MemoryContactStore::new()),
        registry,
        Arc::new(MemoryMessageHistory::new()),
        events,
        config.clone(),
    );

    // Chat needs an MSRP stack plugged in through a media factory
    let module = ImsModule::new(services, None);
    let dispatcher = tokio::spawn(module.clone().run(incoming));

    module.start().await;
    info!("IMS services running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    module.stop().await;
    transport.stop().await;
    dispatcher.abort();

    info!("rcs-ims stopped");
    Ok(())
}
