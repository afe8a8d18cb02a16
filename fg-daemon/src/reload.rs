//! Configuration loading and engine lifecycle
//!
//! All four JSON files are parsed and validated as a unit before anything
//! is swapped: a malformed file rejects the whole candidate and the daemon
//! keeps running on its previous configuration. Only a fully validated
//! candidate tears the old engines down.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, warn};

use fg_core::config::{
    load_pcie_cards, load_presence_config, load_recovery_config, load_zones_config,
    PcieCardMetadata, PresenceConfig, RecoveryConfig, ZonesConfig,
};
use fg_core::constants::files;
use fg_core::monitor::{domain, DomainEventSender};
use fg_core::{Context, ControlEngine, PresenceEngine, RecoveryMonitor, ShutdownDelays,
    ShutdownMonitor};

/// A fully parsed and validated configuration set.
pub struct Configs {
    pub presence: PresenceConfig,
    pub zones: ZonesConfig,
    pub cards: Option<Arc<PcieCardMetadata>>,
    pub recovery: Option<RecoveryConfig>,
}

/// Parse every config file under `config_dir`. Presence and zones are
/// required; PCIe card metadata and recovery actions are optional.
pub fn load_configs(config_dir: &Path) -> fg_error::Result<Configs> {
    let presence = load_presence_config(&config_dir.join(files::PRESENCE))?;
    let zones = load_zones_config(&config_dir.join(files::ZONES))?;

    let cards_path = config_dir.join(files::PCIE_CARDS);
    let cards = if cards_path.exists() {
        Some(Arc::new(load_pcie_cards(&cards_path)?))
    } else {
        None
    };

    let recovery_path = config_dir.join(files::RECOVERY);
    let recovery = if recovery_path.exists() {
        Some(load_recovery_config(&recovery_path)?)
    } else {
        None
    };

    Ok(Configs {
        presence,
        zones,
        cards,
        recovery,
    })
}

/// The three running subsystems plus their shared domain-event channel.
pub struct Engines {
    pub presence: PresenceEngine,
    pub control: ControlEngine,
    pub monitor: Arc<ShutdownMonitor>,
    pub recovery: Option<Arc<RecoveryMonitor>>,
    pub domain: DomainEventSender,
}

impl Engines {
    pub async fn build(
        ctx: &Context,
        configs: &Configs,
        persist_dir: &Path,
    ) -> anyhow::Result<Self> {
        let (domain, _) = domain::channel();

        let presence = PresenceEngine::new(ctx, &configs.presence)
            .await
            .context("building presence engine")?;

        let control = ControlEngine::new(ctx, &configs.zones, configs.cards.clone())
            .context("building control engine")?;

        let monitor = ShutdownMonitor::new(
            ctx.clone(),
            ShutdownDelays::default(),
            persist_dir,
            domain.clone(),
        );

        let recovery = configs
            .recovery
            .as_ref()
            .map(|config| RecoveryMonitor::new(ctx.clone(), config.clone(), domain.clone()));

        Ok(Self {
            presence,
            control,
            monitor,
            recovery,
            domain,
        })
    }

    pub async fn start(&self) {
        self.presence.start().await;
        self.control.start().await;
        self.monitor.start().await;
        if let Some(recovery) = &self.recovery {
            recovery.start().await;
        }
    }

    pub async fn shutdown(&self) {
        self.presence.shutdown().await;
        self.control.shutdown().await;
        self.monitor.shutdown().await;
        if let Some(recovery) = &self.recovery {
            recovery.shutdown().await;
        }
    }

    /// Full state snapshot for the SIGUSR1 dump.
    pub async fn snapshot(&self, ctx: &Context) -> serde_json::Value {
        serde_json::json!({
            "presence": self.presence.snapshot().await,
            "control": self.control.snapshot().await,
            "monitor": self.monitor.snapshot().await,
            "parameters": ctx.params.snapshot(),
            "flight_recorder": ctx.recorder.to_json(),
        })
    }
}

/// SIGHUP handler: build the candidate fully before swapping it in.
///
/// Every candidate subsystem is constructed while the old set is still
/// running, so the protective-shutdown path is never dark during a reload.
/// The one exception forced by hardware is the presence engine: its GPIO
/// line-event handles are exclusive, so the old presence engine alone is
/// stopped to release its lines before the candidate acquires them, and is
/// resumed untouched if the candidate cannot be built. Only once the whole
/// candidate set exists are the remaining old subsystems stopped and the
/// swap made.
pub async fn reload(
    ctx: &Context,
    config_dir: &Path,
    persist_dir: &Path,
    engines: &mut Engines,
) {
    info!("SIGHUP: reloading configuration");

    let candidate = match load_configs(config_dir) {
        Ok(configs) => configs,
        Err(e) => {
            warn!(error = %e, "candidate configuration rejected, keeping previous");
            return;
        }
    };

    // Candidate control/monitor/recovery hold no exclusive hardware and
    // build alongside the running set.
    let (domain, _) = domain::channel();

    let control = match ControlEngine::new(ctx, &candidate.zones, candidate.cards.clone()) {
        Ok(control) => control,
        Err(e) => {
            warn!(error = %e, "candidate control engine rejected, keeping previous");
            return;
        }
    };

    let monitor = ShutdownMonitor::new(
        ctx.clone(),
        ShutdownDelays::default(),
        persist_dir,
        domain.clone(),
    );

    let recovery = candidate
        .recovery
        .as_ref()
        .map(|config| RecoveryMonitor::new(ctx.clone(), config.clone(), domain.clone()));

    // The old presence engine must release its GPIO lines before the
    // candidate can request them.
    engines.presence.shutdown().await;

    let presence = match PresenceEngine::new(ctx, &candidate.presence).await {
        Ok(presence) => presence,
        Err(e) => {
            warn!(error = %e, "candidate presence engine rejected, resuming previous");
            engines.presence.start().await;
            return;
        }
    };

    // The candidate set is complete; stop the rest of the old set and swap
    // in one step.
    engines.control.shutdown().await;
    engines.monitor.shutdown().await;
    if let Some(old_recovery) = &engines.recovery {
        old_recovery.shutdown().await;
    }

    *engines = Engines {
        presence,
        control,
        monitor,
        recovery,
        domain,
    };
    engines.start().await;
    info!("configuration reloaded");
}
