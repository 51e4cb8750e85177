mod session_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{
        EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
    },
    wagate_config::WagateConfig,
};

#[derive(Parser)]
#[command(name = "wagate", about = "wagate, a WhatsApp messaging gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory to look for `wagate.toml` in, instead of `~/.config/wagate`.
    #[arg(long, global = true, env = "WAGATE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Address to bind. Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on. Overrides `server.port`.
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },
    /// Stored session management.
    Session {
        #[command(subcommand)]
        action: session_commands::SessionAction,
    },
}

/// `RUST_LOG` wins over `--log-level`. The protocol crates log every frame at
/// debug, so they stay at `warn` unless named explicitly.
fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},wacore=warn,whatsapp_rust=warn,sled=warn",
            cli.log_level
        ))
    });

    let output = if cli.json_logs {
        fmt::layer().json().with_current_span(false).boxed()
    } else {
        fmt::layer().compact().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> WagateConfig {
    if let Some(dir) = &cli.config_dir {
        wagate_config::set_config_dir(dir.clone());
    }
    wagate_config::discover_and_load()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "wagate starting");

    let mut config = load_config(&cli);

    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            wagate_gateway::server::start_gateway(config).await
        },
        Commands::Session { action } => {
            session_commands::handle_session(action, &config.whatsapp.session_path())
        },
    }
}
