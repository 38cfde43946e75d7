/// Sensor Discovery Tool
///
/// Runs the discovery workflow end to end: connect to a gateway, list the
/// sensors it sees, associate them with equipment and register them in the
/// persistence API.
///
/// Usage:
///   cargo run --bin tool_discover_sensors -- --simulate --equipment eq-1
///   cargo run --bin tool_discover_sensors -- --gateway-id 64f0c2 --equipment eq-1 --assign 1003=eq-2
use clap::Parser;
use std::sync::Arc;

use gatewaylink::{
    config,
    discovery::{DiscoveryStage, DiscoverySettings, DiscoveryWorkflow, StepStatus},
    gateway::{
        simulator::{SimulatedGateway, SimulatorOptions},
        ConnectionManager, ConnectionOptions, Credentials, GatewayId, GatewayIdentity, WsConnector,
    },
    logger::{self, LogTag},
    persistence::{GatewayRecord, HttpSensorRegistry, InMemoryRegistry, SensorRegistry},
};

#[derive(Parser, Debug)]
#[command(name = "tool_discover_sensors")]
#[command(about = "Discover sensors on a gateway and register them against equipment", long_about = None)]
struct Args {
    /// Use the in-process simulated gateway and an in-memory registry
    #[arg(long)]
    simulate: bool,

    /// Gateway record id in the persistence API
    #[arg(long)]
    gateway_id: Option<String>,

    /// Gateway WebSocket URL (skips the gateway record lookup)
    #[arg(long, requires_all = ["username", "password"])]
    url: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Equipment id for sensors without an explicit assignment
    #[arg(short, long)]
    equipment: Option<String>,

    /// Only these serials (comma separated); default is every unregistered sensor
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,

    /// Per-sensor equipment, SERIAL=EQUIPMENT (repeatable)
    #[arg(long, value_parser = parse_pair)]
    assign: Vec<(String, String)>,

    /// Per-sensor name, SERIAL=NAME (repeatable)
    #[arg(long, value_parser = parse_pair)]
    name: Vec<(String, String)>,

    /// Stop after ASSOCIATE and print what would be submitted
    #[arg(long)]
    dry_run: bool,

    /// Configuration file
    #[arg(long, default_value = config::CONFIG_FILE_PATH)]
    config: String,

    // Read by the logger directly from the process arguments
    #[arg(long)]
    debug_connection: bool,
    #[arg(long)]
    debug_discovery: bool,
    #[arg(long)]
    debug_persistence: bool,
    #[arg(short, long)]
    verbose: bool,
}

fn parse_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.trim().is_empty() && !val.trim().is_empty() => {
            Ok((key.trim().to_string(), val.trim().to_string()))
        }
        _ => Err(format!("expected SERIAL=VALUE, got '{}'", value)),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logger::init();

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            logger::error(LogTag::Discovery, &format!("{:#}", e));
            1
        }
    };

    logger::flush();
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<()> {
    config::load_config_from_path(&args.config)?;
    let config = config::get_config_clone();
    let options = ConnectionOptions::from_config(&config);
    let settings = DiscoverySettings::from_config(&config.discovery);

    // The simulator must outlive the workflow
    let mut _simulator = None;

    let (mut workflow, manager) = if args.simulate {
        let sim_options = SimulatorOptions::default();
        let record = GatewayRecord {
            id: "simulated".to_string(),
            name: "Simulated gateway".to_string(),
            url: "memory://simulated".to_string(),
            username: sim_options.username.clone(),
            password: sim_options.password.clone(),
        };
        let simulator = SimulatedGateway::start(sim_options);
        let registry = Arc::new(InMemoryRegistry::new());
        registry.insert_gateway(record);

        let manager = ConnectionManager::init(Arc::new(simulator.connector()), options);
        _simulator = Some(simulator);
        let workflow = DiscoveryWorkflow::for_gateway(
            &GatewayId::new("simulated"),
            manager.clone(),
            registry as Arc<dyn SensorRegistry>,
            settings,
        )
        .await?;
        (workflow, manager)
    } else {
        let registry: Arc<dyn SensorRegistry> = Arc::new(HttpSensorRegistry::from_config(&config.persistence)?);
        let manager = ConnectionManager::init(Arc::new(WsConnector::new()), options);

        let workflow = match (&args.url, &args.gateway_id) {
            (Some(url), gateway_id) => {
                let identity = GatewayIdentity::new(
                    gateway_id.clone().unwrap_or_else(|| url.clone()),
                    url.clone(),
                    Credentials::new(
                        args.username.clone().unwrap_or_default(),
                        args.password.clone().unwrap_or_default(),
                    ),
                );
                DiscoveryWorkflow::new(identity, manager.clone(), registry, settings)
            }
            (None, Some(id)) => {
                DiscoveryWorkflow::for_gateway(&GatewayId::new(id.clone()), manager.clone(), registry, settings).await?
            }
            (None, None) => anyhow::bail!("one of --simulate, --url or --gateway-id is required"),
        };
        (workflow, manager)
    };

    let result = drive(&mut workflow, &args).await;
    manager.shutdown().await;
    result
}

async fn drive(workflow: &mut DiscoveryWorkflow, args: &Args) -> anyhow::Result<()> {
    println!("Gateway {} ({})", workflow.gateway().id, workflow.gateway().url);
    print_steps(workflow);

    workflow.connect().await?;

    let discovered = workflow.discover().await?;
    println!("\n{:<12} {:<12} {:<10} {:<10} {}", "SERIAL", "PART", "FIRMWARE", "STATUS", "NAME");
    println!("{}", "=".repeat(64));
    for sensor in discovered {
        let status = match &sensor.existing_id {
            Some(id) => format!("known #{}", id),
            None => "new".to_string(),
        };
        println!(
            "{:<12} {:<12} {:<10} {:<10} {}",
            sensor.serial(),
            sensor.raw.part_number.as_deref().unwrap_or("-"),
            sensor.raw.firmware_version.as_deref().unwrap_or("-"),
            status,
            sensor.display_name()
        );
    }

    if !args.select.is_empty() {
        workflow.select_all(false)?;
        for serial in &args.select {
            workflow.select(serial, true)?;
        }
    }
    for (serial, equipment) in &args.assign {
        workflow.set_equipment(serial, Some(equipment.as_str()))?;
    }
    for (serial, name) in &args.name {
        workflow.set_custom_name(serial, Some(name.as_str()))?;
    }

    let associated = workflow.associate(args.equipment.as_deref()).map(|a| a.len());
    if let Err(e) = associated {
        for issue in workflow.issues() {
            println!("  {}: {}", issue.serial, issue.message);
        }
        return Err(e.into());
    }

    println!("\nAssociations:");
    for association in workflow.associations() {
        println!(
            "  {} -> equipment {} as '{}'",
            association.serial, association.equipment_id, association.name
        );
    }

    if args.dry_run {
        println!("\nDry run, nothing submitted");
        print_steps(workflow);
        return Ok(());
    }

    let report = workflow.confirm().await?;
    println!("\nRegistered {} sensors", report.succeeded.len());
    for confirmed in &report.succeeded {
        println!(
            "  {} -> equipment {} (sensor #{})",
            confirmed.serial, confirmed.equipment_id, confirmed.sensor_id
        );
    }
    if !report.failed.is_empty() {
        println!("\nFailed {}:", report.failed.len());
        for failed in &report.failed {
            println!("  {} -> equipment {}: {}", failed.serial, failed.equipment_id, failed.message);
        }
    }
    print_steps(workflow);

    if report.is_complete() {
        Ok(())
    } else {
        anyhow::bail!("{} associations were not registered", report.failed.len())
    }
}

fn print_steps(workflow: &DiscoveryWorkflow) {
    let line = DiscoveryStage::ALL
        .iter()
        .map(|stage| {
            let mark = match workflow.status(*stage) {
                StepStatus::Locked => " ",
                StepStatus::Available => "-",
                StepStatus::Active => ">",
                StepStatus::Completed => "x",
            };
            format!("[{}] {}", mark, stage)
        })
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", line);
}
