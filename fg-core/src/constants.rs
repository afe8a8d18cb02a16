//! Central constants for Fanguard
//!
//! Well-known bus names, object paths, unit names, and tunable defaults live
//! here so the rest of the tree never hardcodes them inline.

/// Consumed and produced D-Bus interfaces
pub mod interfaces {
    pub const SENSOR_VALUE: &str = "xyz.openbmc_project.Sensor.Value";
    pub const THRESHOLD_HARD_SHUTDOWN: &str = "xyz.openbmc_project.Sensor.Threshold.HardShutdown";
    pub const THRESHOLD_SOFT_SHUTDOWN: &str = "xyz.openbmc_project.Sensor.Threshold.SoftShutdown";
    pub const THRESHOLD_CRITICAL: &str = "xyz.openbmc_project.Sensor.Threshold.Critical";
    pub const THRESHOLD_WARNING: &str = "xyz.openbmc_project.Sensor.Threshold.Warning";
    pub const CONTROL_FAN_SPEED: &str = "xyz.openbmc_project.Control.FanSpeed";
    pub const CONTROL_FAN_PWM: &str = "xyz.openbmc_project.Control.FanPwm";
    pub const INVENTORY_ITEM: &str = "xyz.openbmc_project.Inventory.Item";
    pub const PCIE_DEVICE: &str = "xyz.openbmc_project.Inventory.Item.PCIeDevice";
    pub const POWER_STATE: &str = "xyz.openbmc_project.State.Decorator.PowerState";
    pub const OPERATIONAL_STATUS: &str = "xyz.openbmc_project.State.Decorator.OperationalStatus";
    pub const AVAILABILITY: &str = "xyz.openbmc_project.State.Decorator.Availability";
    pub const OBJECT_MAPPER: &str = "xyz.openbmc_project.ObjectMapper";
    pub const INVENTORY_MANAGER: &str = "xyz.openbmc_project.Inventory.Manager";
    pub const LOGGING_CREATE: &str = "xyz.openbmc_project.Logging.Create";
    pub const DUMP_CREATE: &str = "xyz.openbmc_project.Dump.Create";
    pub const SYSTEMD_MANAGER: &str = "org.freedesktop.systemd1.Manager";
    pub const SYSTEMD_UNIT: &str = "org.freedesktop.systemd1.Unit";
    pub const PGOOD: &str = "org.openbmc.control.Power";
    pub const HOST_STATE: &str = "xyz.openbmc_project.State.Host";
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
    pub const DBUS: &str = "org.freedesktop.DBus";
}

/// Well-known service names
pub mod services {
    pub const OBJECT_MAPPER: &str = "xyz.openbmc_project.ObjectMapper";
    pub const INVENTORY: &str = "xyz.openbmc_project.Inventory.Manager";
    pub const LOGGING: &str = "xyz.openbmc_project.Logging";
    pub const DUMP_MANAGER: &str = "xyz.openbmc_project.Dump.Manager";
    pub const SYSTEMD: &str = "org.freedesktop.systemd1";
    pub const DBUS: &str = "org.freedesktop.DBus";
}

/// Well-known object paths
pub mod paths {
    use std::path::PathBuf;

    pub const OBJECT_MAPPER: &str = "/xyz/openbmc_project/object_mapper";
    pub const INVENTORY_ROOT: &str = "/xyz/openbmc_project/inventory";
    pub const SENSORS_ROOT: &str = "/xyz/openbmc_project/sensors";
    pub const FAN_TACH_ROOT: &str = "/xyz/openbmc_project/sensors/fan_tach";
    pub const LOGGING: &str = "/xyz/openbmc_project/logging";
    pub const DUMP_BMC: &str = "/xyz/openbmc_project/dump/bmc";
    pub const SYSTEMD: &str = "/org/freedesktop/systemd1";
    pub const DBUS: &str = "/org/freedesktop/DBus";
    pub const PGOOD: &str = "/org/openbmc/control/power0";
    pub const HOST_STATE: &str = "/xyz/openbmc_project/state/host0";

    /// I2C driver directory used for EEPROM bind/unbind
    pub const I2C_DRIVERS: &str = "/sys/bus/i2c/drivers";

    /// Where the state dump lands on SIGUSR1
    pub const DUMP_FILE: &str = "/tmp/fanguard_dump.json";

    /// Root for persisted runtime state, overridable for tests
    pub fn persist_root() -> PathBuf {
        std::env::var_os("FANGUARD_PERSIST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/fanguard"))
    }

    /// Root for JSON configuration
    pub fn config_root() -> PathBuf {
        std::env::var_os("FANGUARD_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/fanguard"))
    }
}

/// Config file names under the config root
pub mod files {
    pub const PRESENCE: &str = "presence.json";
    pub const ZONES: &str = "zones.json";
    pub const PCIE_CARDS: &str = "pcie-cards.json";
    pub const RECOVERY: &str = "recovery-action.json";
    pub const TIMESTAMPS: &str = "shutdownAlarmStartTimes";
}

/// systemd unit names driven by the service
pub mod units {
    pub const HARD_POWEROFF_TARGET: &str = "obmc-chassis-hard-poweroff@0.target";
    pub const CONTROL_SERVICE: &str = "fanguardd.service";
}

/// Tunable defaults
pub mod defaults {
    /// Settle time after power-on before presence conflicts are judged
    pub const POWER_ON_DELAY_SECS: u64 = 5;

    /// Grace period before a hard-shutdown alarm powers the chassis off
    pub const HARD_SHUTDOWN_DELAY_MS: u64 = 23_000;

    /// Grace period before a soft-shutdown alarm powers the chassis off
    pub const SOFT_SHUTDOWN_DELAY_MS: u64 = 900_000;

    /// Delay between EEPROM plug detection and the driver bind write
    pub const EEPROM_BIND_DELAY_MS: u64 = 1_000;

    /// PCIe card floor settle debounce
    pub const PCIE_SETTLE_SECS: u64 = 2;

    /// Flight recorder ring capacity
    pub const FLIGHT_RECORDER_CAPACITY: usize = 200;
}

/// Shared parameter registry keys
pub mod params {
    pub const PCIE_FLOOR_INDEX: &str = "pcie_floor_index";
}
