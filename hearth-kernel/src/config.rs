/**
 * CONFIGURATION KERNEL - Chargement de kernel.yaml + surcharges d'environnement
 *
 * RÔLE : Adresses d'écoute, clé API, fichier de persistance, fenêtres de liveness,
 * dimensionnement du hub et timeouts des commandes synchrones.
 *
 * FONCTIONNEMENT : YAML optionnel ($HEARTH_KERNEL_CONFIG ou kernel.yaml), tous les
 * champs ont une valeur par défaut, puis variables HEARTH_* prioritaires.
 */

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub http_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub api_key: Option<String>,
    pub data_file: Option<PathBuf>,
    pub liveness_window_secs: u64,
    pub sweep_interval_secs: u64,
    pub hub_buffer_size: usize,
    pub subscriber_queue_depth: usize,
    pub rcon_timeout_secs: u64,
    pub backup_timeout_secs: u64,
    pub auto_backup: AutoBackupConf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoBackupConf {
    pub enabled: bool,
    pub interval_hours: u64,
    pub timeout_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            control_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            api_key: None,
            data_file: Some(PathBuf::from("data/fleet.json")),
            liveness_window_secs: 30,
            sweep_interval_secs: 5,
            hub_buffer_size: 256,
            subscriber_queue_depth: 64,
            rcon_timeout_secs: 10,
            backup_timeout_secs: 30,
            auto_backup: AutoBackupConf::default(),
        }
    }
}

impl Default for AutoBackupConf {
    fn default() -> Self {
        Self { enabled: true, interval_hours: 6, timeout_secs: 300 }
    }
}

impl KernelConfig {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn rcon_timeout(&self) -> Duration {
        Duration::from_secs(self.rcon_timeout_secs)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    /// Applique les variables HEARTH_* (prioritaires sur le fichier)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("HEARTH_HTTP_ADDR") {
            match addr.parse() {
                Ok(a) => self.http_addr = a,
                Err(e) => warn!("[config] HEARTH_HTTP_ADDR invalide ({addr}): {e}"),
            }
        }
        if let Some(addr) = lookup("HEARTH_CONTROL_ADDR") {
            match addr.parse() {
                Ok(a) => self.control_addr = a,
                Err(e) => warn!("[config] HEARTH_CONTROL_ADDR invalide ({addr}): {e}"),
            }
        }
        if let Some(key) = lookup("HEARTH_API_KEY").filter(|k| !k.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(path) = lookup("HEARTH_DATA_FILE") {
            self.data_file = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("HEARTH_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_config_file(Path::new(&path)).await;
    cfg.apply_env(|name| std::env::var(name).ok());
    cfg
}

pub async fn load_config_file(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!("[config] pas de {}, usage config par défaut", path.display());
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!("[config] config invalide: {e}");
        KernelConfig::default()
    })
}
