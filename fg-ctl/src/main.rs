//! fanctl - operator CLI for fanguardd
//!
//! Talks to the same bus objects the daemon drives: fan target and tach
//! sensors, inventory presence, and the systemd manager for stopping,
//! resuming, and signalling the control service.

use std::collections::{BTreeMap, BTreeSet};

use clap::{Parser, Subcommand};
use zbus::zvariant::Value;

use fg_core::bus::BusFacade;
use fg_core::constants::{interfaces, paths, services, units};
use fg_core::types::PropertyValue;

#[derive(Parser)]
#[command(name = "fanctl", version, about = "Fanguard control utility")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print fan targets, tach feedback, presence, and service state
    Status,
    /// Print each fan's target sensor and per-rotor feedback
    Get,
    /// Stop automatic control and set a target on the given fans (all if omitted)
    Set {
        target: u64,
        fans: Vec<String>,
    },
    /// Ask the daemon to reload its configuration (SIGHUP)
    Reload,
    /// Restart the automatic-control service
    Resume,
    /// Ask the daemon for a JSON state dump and print its location
    Dump,
    /// Query the state dump
    QueryDump {
        /// Dump section (presence, control, monitor, parameters, flight_recorder)
        #[arg(short = 's', long = "section")]
        section: String,
        /// Filter entries by name (regex)
        #[arg(short = 'n', long = "name")]
        name: Option<String>,
        /// Only print the listed properties
        #[arg(short = 'p', long = "properties")]
        properties: Vec<String>,
        /// Print the section raw
        #[arg(short = 'd', long = "dump")]
        raw: bool,
    },
    /// Print current sensor values
    Sensors {
        /// Sensor type, e.g. temperature, fan_tach
        #[arg(short = 't', long = "type")]
        sensor_type: Option<String>,
        /// Sensor name filter (regex)
        #[arg(short = 'n', long = "name")]
        name: Option<String>,
        /// Include Functional and Available columns
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let bus = match BusFacade::new().await {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("Cannot connect to the system bus: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Status => status(&bus).await,
        Command::Get => get(&bus).await,
        Command::Set { target, fans } => set(&bus, target, &fans).await,
        Command::Reload => kill_unit(&bus, libc::SIGHUP).await,
        Command::Resume => resume(&bus).await,
        Command::Dump => dump(&bus).await,
        Command::QueryDump {
            section,
            name,
            properties,
            raw,
        } => query_dump(&section, name.as_deref(), &properties, raw),
        Command::Sensors {
            sensor_type,
            name,
            verbose,
        } => sensors(&bus, sensor_type.as_deref(), name.as_deref(), verbose).await,
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

/// Last path token, e.g. `/…/fan_tach/fan0_1` → `fan0_1`.
fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Rotor sensor name → fan name: `fan0_1` → `fan0`.
fn fan_of(rotor: &str) -> &str {
    rotor.rsplit_once('_').map(|(fan, _)| fan).unwrap_or(rotor)
}

/// fan name → (target interface, rotor sensor paths), discovered from the
/// control interfaces on the tach namespace.
async fn discover_fans(bus: &BusFacade) -> fg_error::Result<BTreeMap<String, (String, Vec<String>)>> {
    let mut fans: BTreeMap<String, (String, Vec<String>)> = BTreeMap::new();

    for interface in [interfaces::CONTROL_FAN_SPEED, interfaces::CONTROL_FAN_PWM] {
        let sensor_paths = bus
            .get_subtree_paths(paths::SENSORS_ROOT, interface, 0)
            .await
            .unwrap_or_default();
        for path in sensor_paths {
            let fan = fan_of(leaf(&path)).to_string();
            let entry = fans.entry(fan).or_insert_with(|| (interface.to_string(), Vec::new()));
            entry.1.push(path);
        }
    }

    if fans.is_empty() {
        return Err(fg_error::FanGuardError::internal(
            "no fan control sensors found on the bus",
        ));
    }
    Ok(fans)
}

/// Inventory object path for a fan, if the inventory knows it.
async fn inventory_path(bus: &BusFacade, fan: &str) -> Option<String> {
    let inventory = bus
        .get_subtree_paths(paths::INVENTORY_ROOT, interfaces::INVENTORY_ITEM, 0)
        .await
        .ok()?;
    inventory.into_iter().find(|path| leaf(path) == fan)
}

async fn unit_state(bus: &BusFacade, unit: &str) -> String {
    let reply = match bus
        .call_method(
            services::SYSTEMD,
            paths::SYSTEMD,
            interfaces::SYSTEMD_MANAGER,
            "GetUnit",
            &(unit,),
        )
        .await
    {
        Ok(reply) => reply,
        Err(_) => return "inactive".into(),
    };

    let unit_path: zbus::zvariant::OwnedObjectPath = match reply.body().deserialize() {
        Ok(path) => path,
        Err(_) => return "unknown".into(),
    };

    bus.get_property_from::<String>(
        services::SYSTEMD,
        unit_path.as_str(),
        interfaces::SYSTEMD_UNIT,
        "ActiveState",
    )
    .await
    .unwrap_or_else(|_| "unknown".into())
}

async fn status(bus: &BusFacade) -> fg_error::Result<()> {
    let fans = discover_fans(bus).await?;

    println!(
        "{:<10} {:>8} {:>20} {:>9} {:>11}",
        "FAN", "TARGET", "FEEDBACKS", "PRESENT", "FUNCTIONAL"
    );

    for (fan, (interface, sensors)) in &fans {
        let target = match sensors.first() {
            Some(path) => bus
                .get_property::<u64>(path, interface, "Target")
                .await
                .map(|t| t.to_string())
                .unwrap_or_else(|_| "-".into()),
            None => "-".into(),
        };

        let mut feedbacks = Vec::new();
        for path in sensors {
            let value = bus
                .get_property::<f64>(path, interfaces::SENSOR_VALUE, "Value")
                .await
                .map(|v| format!("{:.0}", v))
                .unwrap_or_else(|_| "-".into());
            feedbacks.push(value);
        }

        let (present, functional) = match inventory_path(bus, fan).await {
            Some(path) => {
                let present = bus
                    .get_property::<bool>(&path, interfaces::INVENTORY_ITEM, "Present")
                    .await
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "-".into());
                let functional = bus
                    .get_property::<bool>(&path, interfaces::OPERATIONAL_STATUS, "Functional")
                    .await
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "-".into());
                (present, functional)
            }
            None => ("-".into(), "-".into()),
        };

        println!(
            "{:<10} {:>8} {:>20} {:>9} {:>11}",
            fan,
            target,
            feedbacks.join("/"),
            present,
            functional
        );
    }

    println!();
    println!(
        "{}: {}",
        units::CONTROL_SERVICE,
        unit_state(bus, units::CONTROL_SERVICE).await
    );
    Ok(())
}

async fn get(bus: &BusFacade) -> fg_error::Result<()> {
    let fans = discover_fans(bus).await?;

    println!("{:<10} {:<45} {:>8} {:>10}", "FAN", "SENSOR", "TARGET", "FEEDBACK");
    for (fan, (interface, sensors)) in &fans {
        for path in sensors {
            let target = bus
                .get_property::<u64>(path, interface, "Target")
                .await
                .map(|t| t.to_string())
                .unwrap_or_else(|_| "-".into());
            let feedback = bus
                .get_property::<f64>(path, interfaces::SENSOR_VALUE, "Value")
                .await
                .map(|v| format!("{:.0}", v))
                .unwrap_or_else(|_| "-".into());
            println!("{:<10} {:<45} {:>8} {:>10}", fan, leaf(path), target, feedback);
        }
    }
    Ok(())
}

async fn set(bus: &BusFacade, target: u64, selected: &[String]) -> fg_error::Result<()> {
    let fans = discover_fans(bus).await?;

    for fan in selected {
        if !fans.contains_key(fan) {
            return Err(fg_error::FanGuardError::internal(format!(
                "unknown fan '{}' (known: {})",
                fan,
                fans.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
    }

    // Take automatic control out of the way first.
    bus.call_method(
        services::SYSTEMD,
        paths::SYSTEMD,
        interfaces::SYSTEMD_MANAGER,
        "StopUnit",
        &(units::CONTROL_SERVICE, "replace"),
    )
    .await?;

    for (fan, (interface, sensors)) in &fans {
        if !selected.is_empty() && !selected.contains(fan) {
            continue;
        }
        for path in sensors {
            bus.set_property(path, interface, "Target", Value::from(target))
                .await?;
        }
        println!("{}: target set to {}", fan, target);
    }

    println!("Automatic control stopped; run 'fanctl resume' to restore it.");
    Ok(())
}

async fn kill_unit(bus: &BusFacade, signal: i32) -> fg_error::Result<()> {
    bus.call_method(
        services::SYSTEMD,
        paths::SYSTEMD,
        interfaces::SYSTEMD_MANAGER,
        "KillUnit",
        &(units::CONTROL_SERVICE, "main", signal),
    )
    .await?;
    Ok(())
}

async fn resume(bus: &BusFacade) -> fg_error::Result<()> {
    bus.call_method(
        services::SYSTEMD,
        paths::SYSTEMD,
        interfaces::SYSTEMD_MANAGER,
        "StartUnit",
        &(units::CONTROL_SERVICE, "replace"),
    )
    .await?;
    println!("{} started", units::CONTROL_SERVICE);
    Ok(())
}

async fn dump(bus: &BusFacade) -> fg_error::Result<()> {
    kill_unit(bus, libc::SIGUSR1).await?;

    // Give the daemon a moment to serialize.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    if std::path::Path::new(paths::DUMP_FILE).exists() {
        println!("{}", paths::DUMP_FILE);
        Ok(())
    } else {
        Err(fg_error::FanGuardError::internal(format!(
            "daemon did not produce {}",
            paths::DUMP_FILE
        )))
    }
}

fn query_dump(
    section: &str,
    name: Option<&str>,
    properties: &[String],
    raw: bool,
) -> fg_error::Result<()> {
    let content = std::fs::read_to_string(paths::DUMP_FILE).map_err(|source| {
        fg_error::FanGuardError::FileRead {
            path: paths::DUMP_FILE.into(),
            source,
        }
    })?;
    let dump: serde_json::Value = serde_json::from_str(&content)?;

    let Some(selected) = dump.get(section) else {
        let sections: Vec<&str> = dump
            .as_object()
            .map(|o| o.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default();
        return Err(fg_error::FanGuardError::internal(format!(
            "no section '{}' in dump (have: {})",
            section,
            sections.join(", ")
        )));
    };

    if raw {
        println!("{}", serde_json::to_string_pretty(selected)?);
        return Ok(());
    }

    let name_filter = match name {
        Some(pattern) => Some(regex::Regex::new(pattern).map_err(|e| {
            fg_error::FanGuardError::internal(format!("bad name pattern: {}", e))
        })?),
        None => None,
    };

    let filtered = filter_json(selected, name_filter.as_ref(), properties);
    println!("{}", serde_json::to_string_pretty(&filtered)?);
    Ok(())
}

/// Keep array entries whose name-ish field matches, and optionally restrict
/// objects to the requested properties.
fn filter_json(
    value: &serde_json::Value,
    name: Option<&regex::Regex>,
    properties: &[String],
) -> serde_json::Value {
    match value {
        serde_json::Value::Array(entries) => serde_json::Value::Array(
            entries
                .iter()
                .filter(|entry| match (name, entry.as_object()) {
                    (Some(regex), Some(object)) => ["name", "path", "sensor", "zone"]
                        .iter()
                        .filter_map(|k| object.get(*k))
                        .any(|v| regex.is_match(&v.to_string())),
                    _ => true,
                })
                .map(|entry| filter_json(entry, None, properties))
                .collect(),
        ),
        serde_json::Value::Object(object) => serde_json::Value::Object(
            object
                .iter()
                .filter(|(key, _)| {
                    properties.is_empty() || properties.iter().any(|p| p == *key)
                })
                .map(|(key, v)| (key.clone(), filter_json(v, name, properties)))
                .collect(),
        ),
        other => other.clone(),
    }
}

struct SensorRow {
    name: String,
    value: f64,
    functional: bool,
    available: bool,
}

async fn sensors(
    bus: &BusFacade,
    sensor_type: Option<&str>,
    name: Option<&str>,
    verbose: bool,
) -> fg_error::Result<()> {
    let name_filter = match name {
        Some(pattern) => Some(regex::Regex::new(pattern).map_err(|e| {
            fg_error::FanGuardError::internal(format!("bad name pattern: {}", e))
        })?),
        None => None,
    };

    let subtree = bus
        .get_subtree(paths::SENSORS_ROOT, interfaces::SENSOR_VALUE, 0)
        .await?;

    let sensor_services: BTreeSet<String> = subtree
        .values()
        .flat_map(|owners| owners.keys().cloned())
        .collect();

    let mut rows = Vec::new();

    for service in sensor_services {
        let objects = match bus.get_managed_objects(&service, "/").await {
            Ok(objects) => objects,
            Err(_) => continue,
        };

        for (path, ifaces) in objects {
            let Some(props) = ifaces.get(interfaces::SENSOR_VALUE) else {
                continue;
            };

            let path = path.to_string();
            let Some(rest) = path.strip_prefix(&format!("{}/", paths::SENSORS_ROOT)) else {
                continue;
            };
            let (kind, sensor_name) = rest.split_once('/').unwrap_or(("", rest));

            if let Some(wanted) = sensor_type {
                if kind != wanted {
                    continue;
                }
            }
            if let Some(regex) = &name_filter {
                if !regex.is_match(sensor_name) {
                    continue;
                }
            }

            let Some(value) = props
                .get("Value")
                .and_then(PropertyValue::from_variant)
                .and_then(|v| v.numeric())
            else {
                continue;
            };

            let flag = |iface: &str, prop: &str, default| {
                ifaces
                    .get(iface)
                    .and_then(|p| p.get(prop))
                    .and_then(PropertyValue::from_variant)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(default)
            };

            rows.push(SensorRow {
                name: format!("{}/{}", kind, sensor_name),
                value,
                functional: flag(interfaces::OPERATIONAL_STATUS, "Functional", true),
                available: flag(interfaces::AVAILABILITY, "Available", true),
            });
        }
    }

    rows.sort_by(|a, b| a.name.cmp(&b.name));

    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(10);
    for row in rows {
        if verbose {
            println!(
                "{:<width$} {:>12.3} functional={} available={}",
                row.name,
                row.value,
                row.functional,
                row.available,
                width = width
            );
        } else {
            println!("{:<width$} {:>12.3}", row.name, row.value, width = width);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_name_helpers() {
        assert_eq!(leaf("/xyz/openbmc_project/sensors/fan_tach/fan0_1"), "fan0_1");
        assert_eq!(fan_of("fan0_1"), "fan0");
        assert_eq!(fan_of("fan12"), "fan12");
    }

    #[test]
    fn test_filter_json_by_name_and_properties() {
        let value = serde_json::json!([
            { "name": "fan0", "target": 4000, "floor": 3000 },
            { "name": "fan1", "target": 5000, "floor": 3000 }
        ]);
        let regex = regex::Regex::new("fan0").unwrap();
        let filtered = filter_json(&value, Some(&regex), &["target".to_string()]);
        assert_eq!(filtered, serde_json::json!([{ "target": 4000 }]));
    }
}
