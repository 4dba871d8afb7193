use drivemirrord::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,drivemirrord=debug";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    FullResync,
    RegisterWatch { address: String },
    StopWatch { channel_id: String, resource_id: String },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mode = match command.as_str() {
        "run" => CliMode::Run,
        "sync-once" => CliMode::SyncOnce,
        "full-resync" => CliMode::FullResync,
        "register-watch" => {
            let Some(address) = args.next() else {
                anyhow::bail!("register-watch needs a notification address");
            };
            CliMode::RegisterWatch { address }
        }
        "stop-watch" => match (args.next(), args.next()) {
            (Some(channel_id), Some(resource_id)) => CliMode::StopWatch {
                channel_id,
                resource_id,
            },
            _ => anyhow::bail!("stop-watch needs <channel-id> <resource-id>"),
        },
        "--help" | "-h" => CliMode::Help,
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_help() {
    println!("Usage: drivemirrord [COMMAND]");
    println!("  run                                  Serve triggers and poll (default)");
    println!("  sync-once                            Mirror changes since the watermark and exit");
    println!("  full-resync                          Reset the watermark and mirror everything");
    println!("  register-watch <address>             Register a push channel for the change feed");
    println!("  stop-watch <channel-id> <resource-id>  Stop a push channel");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    init_tracing();
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::SyncOnce => {
            let stats = daemon.engine().sync_manual().await?;
            println!("{}", serde_json::to_string(&stats)?);
            Ok(())
        }
        CliMode::FullResync => {
            let stats = daemon.engine().full_resync().await?;
            println!("{}", serde_json::to_string(&stats)?);
            Ok(())
        }
        CliMode::RegisterWatch { address } => {
            let channel = daemon.register_watch(&address).await?;
            println!("{}", serde_json::to_string_pretty(&channel)?);
            Ok(())
        }
        CliMode::StopWatch {
            channel_id,
            resource_id,
        } => daemon.stop_watch(&channel_id, &resource_id).await,
        CliMode::Help => Ok(()),
    }
}
