//! Runtime state and the single apply path.
//!
//! Startup, SIGHUP reloads and control API mutations all go through the
//! [`Hub`], which holds one apply lock so that none of them interleave. A
//! reload parses and validates the new file before touching anything; a
//! bad file leaves the running configuration in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use portico_events::LogLevel;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, DnsConfig, General, Mode};
use crate::dns::{ResolverSlot, UdpResolver};
use crate::inbound::{InboundSpec, Ports};
use crate::log::LogHandle;
use crate::manager::{LegacyBinding, ListenerManager, ReconcileReport};
use crate::rules::RuleTable;
use crate::statistic::StatisticManager;

/// Values given on the command line or in the environment. They survive
/// reloads and win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub external_controller: Option<String>,
    pub secret: Option<String>,
}

impl Overrides {
    fn apply(&self, general: &mut General) {
        if let Some(addr) = &self.external_controller {
            general.external_controller = Some(addr.clone());
        }
        if let Some(secret) = &self.secret {
            general.secret = secret.clone();
        }
    }
}

/// Partial update of the general settings (`PATCH /configs`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralPatch {
    pub port: Option<u16>,
    pub socks_port: Option<u16>,
    pub redir_port: Option<u16>,
    pub tproxy_port: Option<u16>,
    pub mixed_port: Option<u16>,
    pub allow_lan: Option<bool>,
    pub bind_address: Option<String>,
    pub mode: Option<Mode>,
    pub log_level: Option<LogLevel>,
}

impl GeneralPatch {
    fn merge_into(self, general: &mut General) {
        let ports = &mut general.ports;
        ports.port = self.port.unwrap_or(ports.port);
        ports.socks_port = self.socks_port.unwrap_or(ports.socks_port);
        ports.redir_port = self.redir_port.unwrap_or(ports.redir_port);
        ports.tproxy_port = self.tproxy_port.unwrap_or(ports.tproxy_port);
        ports.mixed_port = self.mixed_port.unwrap_or(ports.mixed_port);
        if let Some(allow_lan) = self.allow_lan {
            general.allow_lan = allow_lan;
        }
        if let Some(bind_address) = self.bind_address {
            general.bind_address = bind_address;
        }
        if let Some(mode) = self.mode {
            general.mode = mode;
        }
        if let Some(log_level) = self.log_level {
            general.log_level = log_level;
        }
    }
}

/// Shared runtime state behind the control API and the signal handler.
pub struct Hub {
    manager: Arc<ListenerManager>,
    stats: StatisticManager,
    rules: RuleTable,
    resolver: ResolverSlot,
    log: LogHandle,
    general: ArcSwap<General>,
    config_path: PathBuf,
    overrides: Overrides,
    apply_lock: Mutex<()>,
}

impl Hub {
    pub fn new(
        manager: Arc<ListenerManager>,
        stats: StatisticManager,
        log: LogHandle,
        config_path: PathBuf,
        overrides: Overrides,
    ) -> Self {
        Self {
            manager,
            stats,
            rules: RuleTable::default(),
            resolver: ResolverSlot::new(),
            log,
            general: ArcSwap::from_pointee(General::default()),
            config_path,
            overrides,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &ListenerManager {
        &self.manager
    }

    pub fn stats(&self) -> &StatisticManager {
        &self.stats
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn resolver(&self) -> &ResolverSlot {
        &self.resolver
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Current general settings.
    pub fn general(&self) -> Arc<General> {
        self.general.load_full()
    }

    /// Control API secret. Empty disables authentication.
    pub fn secret(&self) -> String {
        self.general.load().secret.clone()
    }

    /// Apply a full configuration snapshot.
    pub async fn apply_config(&self, mut config: Config) {
        let _guard = self.apply_lock.lock().await;
        self.overrides.apply(&mut config.general);

        self.apply_log_level(config.general.log_level);

        self.manager
            .set_legacy_binding(binding_of(&config.general))
            .await;
        let ports = self.manager.recreate_ports_listeners(config.general.ports).await;
        let inbounds = self.manager.re_create_listeners(&config.inbounds).await;
        let tunnels = self.manager.tunnels().patch(&config.tunnels).await;

        self.rules.replace(config.rules);
        self.update_dns(&config.dns);
        self.general.store(Arc::new(config.general));

        info!(
            ports_created = ports.created.len(),
            inbounds_created = inbounds.created.len(),
            tunnels_created = tunnels.created.len(),
            failed = ports.failed.len() + inbounds.failed.len() + tunnels.failed.len(),
            "Configuration applied"
        );
    }

    /// Re-read the config file and apply it. Nothing changes when the file
    /// does not parse.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let config = Config::load(&self.config_path)?;
        self.apply_config(config).await;
        Ok(())
    }

    /// Merge `patch` into the general settings and rebuild the legacy port
    /// listeners.
    pub async fn patch_general(&self, patch: GeneralPatch) -> Arc<General> {
        let _guard = self.apply_lock.lock().await;

        let mut general = General::clone(&self.general.load());
        patch.merge_into(&mut general);

        self.apply_log_level(general.log_level);
        self.manager.set_legacy_binding(binding_of(&general)).await;
        self.manager.recreate_ports_listeners(general.ports).await;

        let general = Arc::new(general);
        self.general.store(Arc::clone(&general));
        general
    }

    /// Replace the explicit inbounds.
    pub async fn update_inbounds(&self, inbounds: &[InboundSpec]) -> ReconcileReport<InboundSpec> {
        let _guard = self.apply_lock.lock().await;
        self.manager.re_create_listeners(inbounds).await
    }

    /// Current legacy port settings.
    pub fn ports(&self) -> Ports {
        self.general.load().ports
    }

    /// Close every listener, tunnel and tracked connection.
    pub async fn shutdown(&self) {
        let _guard = self.apply_lock.lock().await;
        self.manager.close_all().await;
        let closed = self.stats.close_all();
        info!(connections = closed, "Listeners closed");
    }

    fn apply_log_level(&self, level: LogLevel) {
        if let Err(e) = self.log.set_level(level) {
            warn!(error = %e, level = %level, "Log level not applied");
        }
    }

    fn update_dns(&self, dns: &DnsConfig) {
        if !dns.enable {
            self.resolver.set(None);
            return;
        }
        let resolver = UdpResolver::new(dns.nameservers.clone(), dns.timeout);
        self.resolver.set(Some(Box::new(resolver)));
    }
}

fn binding_of(general: &General) -> LegacyBinding {
    LegacyBinding {
        allow_lan: general.allow_lan,
        bind_host: general.bind_address.clone(),
    }
}
