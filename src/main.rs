use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use gatewaylink::{
    arguments::{get_enabled_debug_modes, is_ping_enabled, is_simulate_enabled, patterns, print_help},
    config::{self, Config},
    gateway::{
        simulator::{SimulatedGateway, SimulatorOptions},
        ConnectionManager, ConnectionOptions, Connector, Credentials, GatewayConnection, GatewayId,
        GatewayIdentity, WsConnector,
    },
    logger::{self, LogTag},
    persistence::{HttpSensorRegistry, SensorRegistry},
    telemetry::{SensorSerial, TelemetrySettings, TelemetryStore},
};

/// Connect to one gateway, optionally ping it and stream telemetry
///
/// Target selection, first match wins:
/// - `--simulate`: in-process simulated gateway
/// - `--url` with `--username` / `--password`
/// - `--gateway-id`: record looked up through the persistence API
#[tokio::main]
async fn main() {
    logger::init();

    if patterns::is_help_requested() {
        print_help();
        std::process::exit(0);
    }

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            logger::error(LogTag::System, &format!("{:#}", e));
            1
        }
    };

    logger::flush();
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let config_path = patterns::get_config_path().unwrap_or_else(|| config::CONFIG_FILE_PATH.to_string());
    config::load_config_from_path(&config_path)?;
    let config = config::get_config_clone();

    logger::info(LogTag::System, "gatewaylink starting");
    let debug_modes = get_enabled_debug_modes();
    if !debug_modes.is_empty() {
        logger::info(
            LogTag::System,
            &format!("Debug output enabled for: {}", debug_modes.join(", ")),
        );
    }

    let watch = patterns::get_watch_serials();
    let (identity, connector, _simulator) = resolve_target(&config, !watch.is_empty()).await?;

    let manager = ConnectionManager::init(connector, ConnectionOptions::from_config(&config));
    let conn = manager
        .connect(identity)
        .await
        .context("Gateway connection failed")?;

    if is_ping_enabled() {
        let pong = conn.ping().await.context("Ping failed")?;
        logger::info(
            LogTag::System,
            &format!("Gateway {} answered ping in {}ms", conn.id(), pong.latency_ms),
        );
    }

    if !watch.is_empty() {
        let duration = Duration::from_secs(patterns::get_duration_seconds().unwrap_or(30));
        watch_telemetry(&conn, &config, &watch, duration).await;
    }

    let snapshot = conn.snapshot();
    logger::info(
        LogTag::System,
        &format!(
            "Gateway {}: {} | sent {} | received {} | errors {}",
            snapshot.gateway_id,
            snapshot.state,
            snapshot.stats.messages_sent,
            snapshot.stats.messages_received,
            snapshot.stats.error_count
        ),
    );

    manager.shutdown().await;
    Ok(())
}

async fn resolve_target(
    config: &Config,
    push_telemetry: bool,
) -> anyhow::Result<(GatewayIdentity, Arc<dyn Connector>, Option<SimulatedGateway>)> {
    if is_simulate_enabled() {
        let options = SimulatorOptions {
            topic_prefix: config.telemetry.topic_prefix.clone(),
            push_interval: push_telemetry.then(|| Duration::from_secs(2)),
            ..SimulatorOptions::default()
        };
        let credentials = Credentials::new(options.username.clone(), options.password.clone());
        let simulator = SimulatedGateway::start(options);
        logger::info(LogTag::System, "Using simulated gateway");

        let identity = GatewayIdentity::new("simulated", "memory://simulated", credentials);
        let connector: Arc<dyn Connector> = Arc::new(simulator.connector());
        return Ok((identity, connector, Some(simulator)));
    }

    if let Some(url) = patterns::get_gateway_url() {
        let (Some(username), Some(password)) = (patterns::get_username(), patterns::get_password()) else {
            bail!("--url requires --username and --password");
        };
        let id = patterns::get_gateway_id().unwrap_or_else(|| url.clone());
        let identity = GatewayIdentity::new(id, url, Credentials::new(username, password));
        identity.validate_url()?;
        let connector: Arc<dyn Connector> = Arc::new(WsConnector::new());
        return Ok((identity, connector, None));
    }

    if let Some(id) = patterns::get_gateway_id() {
        let registry = HttpSensorRegistry::from_config(&config.persistence)?;
        let record = registry
            .gateway(&GatewayId::new(id))
            .await
            .context("Gateway lookup failed")?;
        logger::info(
            LogTag::System,
            &format!("Gateway '{}' resolved to {}", record.name, record.url),
        );
        let connector: Arc<dyn Connector> = Arc::new(WsConnector::new());
        return Ok((record.identity(), connector, None));
    }

    print_help();
    bail!("no gateway given: use --simulate, --url or --gateway-id");
}

/// Pull one reading per sensor, then follow pushes until the duration ends or Ctrl+C
async fn watch_telemetry(conn: &GatewayConnection, config: &Config, serials: &[SensorSerial], duration: Duration) {
    let store = Arc::new(TelemetryStore::new(TelemetrySettings::from_config(&config.telemetry)));

    for serial in serials {
        if let Err(e) = store.take_dynamic_temperature(conn, *serial).await {
            logger::warning(LogTag::Telemetry, &format!("Sensor {}: {}", serial, e));
        }
        if let Err(e) = store.take_dynamic_battery(conn, *serial).await {
            logger::warning(LogTag::Telemetry, &format!("Sensor {}: {}", serial, e));
        }
    }

    let tracker = store.track(conn, serials);
    logger::info(
        LogTag::System,
        &format!("Watching {} sensors for {}s", serials.len(), duration.as_secs()),
    );

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut report = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                logger::info(LogTag::System, "Interrupted");
                break;
            }
            _ = report.tick() => print_readings(&store, conn.id(), serials),
        }
    }

    tracker.stop();
    print_readings(&store, conn.id(), serials);
}

fn print_readings(store: &TelemetryStore, gateway: &GatewayId, serials: &[SensorSerial]) {
    for serial in serials {
        let temperature = store
            .temperature(gateway, *serial)
            .map(|r| format!("{:.1}°C", r.celsius))
            .unwrap_or_else(|| "-".to_string());
        let battery = store
            .battery(gateway, *serial)
            .map(|r| format!("{:.0}%", r.percent))
            .unwrap_or_else(|| "-".to_string());
        let vibration = store
            .vibration(gateway, *serial)
            .map(|r| {
                let (x, y, z) = r.samples.rms();
                format!("rms {:.3}/{:.3}/{:.3}", x, y, z)
            })
            .unwrap_or_else(|| "-".to_string());

        logger::info(
            LogTag::Telemetry,
            &format!(
                "Sensor {} | temperature {} | battery {} | vibration {}",
                serial, temperature, battery, vibration
            ),
        );
    }
}
