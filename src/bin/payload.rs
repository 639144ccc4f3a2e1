use chrono::Utc;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use eos_payload::bus::{BusBroker, TcpBus};
use eos_payload::config::PayloadConfig;
use eos_payload::driver::DriverRuntime;
use eos_payload::drivers::DriverRegistry;
use eos_payload::logging::{init_logging, log_path};
use eos_payload::supervisor::{prepare_output_dir, ProcessLauncher, Supervisor};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("eos-payload")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Payload Software Team")
        .about("Balloon payload flight software: supervises the configured drivers")
        .setting(AppSettings::SubcommandsNegateReqs)
        .arg(config_arg())
        .arg(output_arg())
        .subcommand(
            SubCommand::with_name("driver")
                .about("Run a single driver (started by the supervisor)")
                .setting(AppSettings::Hidden)
                .arg(config_arg())
                .arg(output_arg())
                .arg(
                    Arg::with_name("pretty-id")
                        .long("pretty-id")
                        .value_name("PRETTY_ID")
                        .help("Driver to run, e.g. radio-003")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        ("driver", Some(sub_matches)) => run_driver(sub_matches).await,
        _ => run_supervisor(&matches).await,
    }
}

fn config_arg() -> Arg<'static, 'static> {
    Arg::with_name("config")
        .short("c")
        .long("config")
        .value_name("FILE")
        .help("Payload configuration file (JSON)")
        .takes_value(true)
        .required(true)
}

fn output_arg() -> Arg<'static, 'static> {
    Arg::with_name("output")
        .short("o")
        .long("output")
        .value_name("DIR")
        .help("Existing directory for logs, data and artifacts")
        .takes_value(true)
        .required(true)
}

fn paths<'a>(matches: &'a ArgMatches<'_>) -> Result<(&'a Path, &'a Path), Box<dyn std::error::Error>> {
    let config = matches.value_of("config").ok_or("missing --config")?;
    let output = matches.value_of("output").ok_or("missing --output")?;
    Ok((Path::new(config), Path::new(output)))
}

fn shutdown_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        token.cancel();
    });
}

async fn run_supervisor(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let (config_path, output_dir) = paths(matches)?;
    prepare_output_dir(output_dir)?;
    init_logging(&log_path(output_dir, "supervisor"))?;

    let config = PayloadConfig::from_file(config_path)?;
    let registry = DriverRegistry::builtin();
    let outcomes = config.configure_devices(&registry);

    let broker = BusBroker::bind(&config.bus_address).await?;
    info!("bus broker listening on {}", broker.local_addr()?);
    let broker_task = tokio::spawn(broker.run());

    let mut supervisor = Supervisor::from_config(&config);
    supervisor.load_devices(outcomes, Utc::now());

    let bus = match TcpBus::connect(&config.bus_address).await {
        Ok(bus) => {
            if let Err(e) = supervisor.subscribe_heartbeats(bus.as_ref()) {
                error!("unable to subscribe to heartbeats: {}", e);
            }
            Some(bus)
        }
        Err(e) => {
            error!("supervisor could not join the bus: {}", e);
            None
        }
    };

    let launcher = ProcessLauncher::current(config_path, output_dir)?;
    supervisor.spawn_drivers(&launcher, Utc::now());

    let token = CancellationToken::new();
    shutdown_on_ctrl_c(token.clone());
    let report = supervisor.run(token).await;
    info!("final {}", report);

    if let Some(bus) = bus {
        bus.close().await;
    }
    broker_task.abort();
    Ok(())
}

async fn run_driver(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let (config_path, output_dir) = paths(matches)?;
    let pretty_id = matches.value_of("pretty-id").ok_or("missing --pretty-id")?;
    init_logging(&log_path(output_dir, pretty_id))?;

    let config = PayloadConfig::from_file(config_path)?;
    let registry = DriverRegistry::builtin();
    let device = config
        .find_device(&registry, pretty_id)
        .ok_or_else(|| format!("no valid device configured as '{pretty_id}'"))?;
    let required_settings = registry
        .get(&device.driver_class)
        .map(|entry| entry.required_settings)
        .unwrap_or_default();
    let driver = registry.build(&device)?;

    let mut runtime = DriverRuntime::init(
        output_dir,
        device,
        driver,
        required_settings,
        &config.bus_address,
    )
    .await?;
    runtime.set_health_interval(config.health_interval());

    shutdown_on_ctrl_c(runtime.cancellation_token());
    runtime.run().await;
    Ok(())
}
