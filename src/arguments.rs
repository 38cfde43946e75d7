/// Centralized command-line argument handling
///
/// Arguments are captured once into `CMD_ARGS` and queried from anywhere
/// (logger, binaries). Tests override them with `set_cmd_args`.
use once_cell::sync::Lazy;
use std::env;
use std::sync::Mutex;

pub static CMD_ARGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(env::args().collect()));

/// Override the stored arguments (binaries and tests)
pub fn set_cmd_args(args: Vec<String>) {
    if let Ok(mut cmd_args) = CMD_ARGS.lock() {
        *cmd_args = args;
    }
}

/// Copy of the current arguments, falling back to `env::args` if poisoned
pub fn get_cmd_args() -> Vec<String> {
    match CMD_ARGS.lock() {
        Ok(args) => args.clone(),
        Err(_) => env::args().collect(),
    }
}

pub fn has_arg(arg: &str) -> bool {
    get_cmd_args().iter().any(|a| a == arg)
}

/// Value following `flag`, if any
pub fn get_arg_value(flag: &str) -> Option<String> {
    let args = get_cmd_args();
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .filter(|v| !v.starts_with("--"))
        .cloned()
}

// =============================================================================
// DEBUG FLAGS
// =============================================================================

pub fn is_debug_connection_enabled() -> bool {
    has_arg("--debug-connection")
}

pub fn is_debug_commands_enabled() -> bool {
    has_arg("--debug-commands")
}

pub fn is_debug_topics_enabled() -> bool {
    has_arg("--debug-topics")
}

pub fn is_debug_telemetry_enabled() -> bool {
    has_arg("--debug-telemetry")
}

pub fn is_debug_discovery_enabled() -> bool {
    has_arg("--debug-discovery")
}

pub fn is_debug_manager_enabled() -> bool {
    has_arg("--debug-manager")
}

pub fn is_debug_persistence_enabled() -> bool {
    has_arg("--debug-persistence")
}

// =============================================================================
// MODE FLAGS
// =============================================================================

/// Run against the in-process simulated gateway instead of a real one
pub fn is_simulate_enabled() -> bool {
    has_arg("--simulate")
}

pub fn is_ping_enabled() -> bool {
    has_arg("--ping")
}

pub fn print_help() {
    println!("gatewaylink - sensor gateway connection and telemetry client");
    println!();
    println!("USAGE:");
    println!("    gatewaylink [FLAGS]");
    println!();
    println!("CONNECTION:");
    println!("    --url <ws-url>            Gateway WebSocket endpoint");
    println!("    --gateway-id <id>         Gateway record id (looked up via the persistence API if --url is absent)");
    println!("    --username <name>         Gateway credentials");
    println!("    --password <secret>       Gateway credentials");
    println!("    --simulate                Use the built-in simulated gateway");
    println!("    --config <path>           Configuration file (default: data/config.toml)");
    println!();
    println!("ACTIONS:");
    println!("    --ping                    Send a ping command and print the latency");
    println!("    --watch <s1,s2,...>       Stream telemetry for the given sensor serials");
    println!("    --duration <secs>         How long to keep watching (default: 30)");
    println!();
    println!("LOGGING:");
    println!("    --debug-connection        Connection state machine debug output");
    println!("    --debug-commands          Command correlation debug output");
    println!("    --debug-topics            Topic routing debug output");
    println!("    --debug-telemetry         Telemetry cache debug output");
    println!("    --debug-discovery         Discovery workflow debug output");
    println!("    --debug-manager           Connection manager debug output");
    println!("    --debug-persistence       Persistence API debug output");
    println!("    --verbose, -v             Everything, including raw frames");
    println!("    --quiet, -q               Warnings and errors only");
    println!("    --no-log-file             Do not write logs/gatewaylink_<date>.log");
    println!();
    println!("EXAMPLES:");
    println!("    gatewaylink --simulate --ping");
    println!("    gatewaylink --url ws://10.0.0.5:8080/ws --username admin --password secret --watch 1001,1002");
    println!("    gatewaylink --gateway-id 64f0c2 --ping --debug-connection");
}

// =============================================================================
// UTILITY FUNCTIONS
// =============================================================================

pub fn get_enabled_debug_modes() -> Vec<&'static str> {
    let checks: [(&'static str, fn() -> bool); 7] = [
        ("connection", is_debug_connection_enabled),
        ("commands", is_debug_commands_enabled),
        ("topics", is_debug_topics_enabled),
        ("telemetry", is_debug_telemetry_enabled),
        ("discovery", is_debug_discovery_enabled),
        ("manager", is_debug_manager_enabled),
        ("persistence", is_debug_persistence_enabled),
    ];

    checks
        .iter()
        .filter(|(_, enabled)| enabled())
        .map(|(name, _)| *name)
        .collect()
}

pub fn is_any_debug_enabled() -> bool {
    !get_enabled_debug_modes().is_empty()
}

/// Common argument patterns shared by the binaries
pub mod patterns {
    use super::*;

    pub fn is_help_requested() -> bool {
        has_arg("--help") || has_arg("-h")
    }

    pub fn get_duration_seconds() -> Option<u64> {
        get_arg_value("--duration").and_then(|s| s.parse().ok())
    }

    pub fn get_config_path() -> Option<String> {
        get_arg_value("--config")
    }

    pub fn get_gateway_url() -> Option<String> {
        get_arg_value("--url")
    }

    pub fn get_gateway_id() -> Option<String> {
        get_arg_value("--gateway-id")
    }

    pub fn get_username() -> Option<String> {
        get_arg_value("--username")
    }

    pub fn get_password() -> Option<String> {
        get_arg_value("--password")
    }

    /// Comma-separated serial list passed to `--watch`
    pub fn get_watch_serials() -> Vec<u64> {
        get_arg_value("--watch")
            .map(|v| {
                v.split(',')
                    .filter_map(|s| s.trim().parse::<u64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
