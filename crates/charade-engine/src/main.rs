use charade_engine::engine::{Engine, EngineSettings};
use charade_engine::features::EngineFeatures;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "charade")]
struct Args {
    #[arg(short, long, default_value = "8080")]
    port: u16,
    /// Directories holding mock configuration documents
    #[arg(short, long, required = true)]
    config: Vec<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let settings = EngineSettings {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        config_dirs: args.config,
        features: EngineFeatures::from_env(),
    };

    let engine = Engine::bind(settings).await?;
    info!("Mock engine ready on {}", engine.local_addr()?);

    tokio::select! {
        _ = engine.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}
