use std::path::PathBuf;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use slipway_core::{ProjectId, SlipwayConfig, UserId};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file (defaults apply when omitted)");

    Command::new("slipway")
        .version(slipway_core::VERSION)
        .about("Single-host build and deploy orchestrator")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("config")
                .about("Validate a configuration and print it resolved, as JSON")
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("deploy")
                .about("Build a source tree and run it behind the health gate until Ctrl-C")
                .arg(config_arg)
                .arg(
                    Arg::new("user")
                        .long("user")
                        .required(true)
                        .value_parser(value_parser!(UserId))
                        .help("Owning user id (UUID)"),
                )
                .arg(
                    Arg::new("project")
                        .long("project")
                        .required(true)
                        .value_parser(value_parser!(ProjectId))
                        .help("Project id (UUID)"),
                )
                .arg(
                    Arg::new("source")
                        .long("source")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Project source directory"),
                ),
        )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn load_config(args: &ArgMatches) -> anyhow::Result<SlipwayConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => SlipwayConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(SlipwayConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("config", args)) => {
            let config = load_config(args)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(("deploy", args)) => deploy(args).await,
        _ => {
            cli().print_help()?;
            Ok(())
        }
    }
}

#[cfg(feature = "docker")]
async fn deploy(args: &ArgMatches) -> anyhow::Result<()> {
    use std::sync::Arc;
    use std::time::Duration;

    use slipway_core::MemoryStore;
    use slipway_orchestrator::{DeploymentOrchestrator, InstanceView};
    use slipway_ports::TcpProbe;
    use slipway_sandbox::DockerRuntime;

    let config = load_config(args)?;
    let user = *args.get_one::<UserId>("user").context("--user is required")?;
    let project = *args
        .get_one::<ProjectId>("project")
        .context("--project is required")?;
    let source = args
        .get_one::<PathBuf>("source")
        .context("--source is required")?;

    let runtime = DockerRuntime::connect_local(config.runtime.host.clone())?;
    runtime.ping().await.context("docker daemon not reachable")?;
    let probe = TcpProbe::new(Duration::from_millis(config.ports.probe_connect_timeout_ms));

    let orchestrator = DeploymentOrchestrator::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(runtime),
        Arc::new(probe),
    )?;

    let deployment = orchestrator.build_and_deploy(user, project, source).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&InstanceView::from(&deployment.instance))?
    );

    tracing::info!(instance_id = %deployment.instance.id, "serving, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    orchestrator.stop(deployment.instance.id).await?;
    Ok(())
}

#[cfg(not(feature = "docker"))]
#[allow(clippy::unused_async)]
async fn deploy(_args: &ArgMatches) -> anyhow::Result<()> {
    anyhow::bail!("slipway was built without a container runtime; rebuild with `--features docker`")
}
