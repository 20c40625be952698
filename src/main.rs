use clap::Parser;
use kabeuchi_server::config::ServerConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kabeuchi", version, about = "Chat front end for a hosted AI agent")]
struct Cli {
    /// Path to kabeuchi.toml
    #[arg(short, long, env = "KABEUCHI_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, e.g. 0.0.0.0
    #[arg(long, env = "KABEUCHI_BIND")]
    bind: Option<String>,

    #[arg(short, long, env = "KABEUCHI_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if cli.port.is_some() {
        config.port = cli.port;
    }

    kabeuchi_server::run(config).await
}
