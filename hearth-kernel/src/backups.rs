/**
 * SAUVEGARDES - Déclenchement (manuel/auto) et enregistrement des archives
 *
 * RÔLE : BACKUP synchrone vers le nœud propriétaire ; le nœud répond
 * "<chemin>|<taille>" et le kernel enregistre un `BackupRecord`.
 * Tâche périodique (6h par défaut) sur toutes les instances "running".
 * La rétention des archives n'est pas gérée ici.
 */

use crate::models::{BackupKind, BackupRecord};
use crate::operations::{audit, locate, OperationError};
use crate::state::KernelState;
use hearth_protocol::{BackendCommand, CommandKind, InstanceStatus};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

pub const AUTO_PAYLOAD: &str = "auto";

/// Décode "<chemin>|<taille>" ; le chemin peut lui-même contenir '|'
pub fn parse_backup_result(result: &str) -> Option<(String, u64)> {
    let (path, size) = result.trim().rsplit_once('|')?;
    if path.is_empty() {
        return None;
    }
    Some((path.to_string(), size.trim().parse().ok()?))
}

pub async fn create_backup(
    state: &KernelState,
    instance_id: &str,
    note: &str,
    kind: BackupKind,
    timeout: Duration,
) -> Result<BackupRecord, OperationError> {
    let (instance, node) = locate(state, instance_id)?;
    let (command_id, payload) = match kind {
        BackupKind::Manual => (Uuid::new_v4().to_string(), note.to_string()),
        BackupKind::Auto => (format!("auto-{}", Uuid::new_v4()), AUTO_PAYLOAD.to_string()),
    };
    let command = BackendCommand::new(command_id, CommandKind::Backup, instance.config()).with_payload(payload);

    let outcome = state.dispatcher.execute(&node.token, &command, timeout).await;
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            audit(state, Some(&node.id), Some(instance_id), "backup", e.to_string(), false);
            return Err(e.into());
        }
    };
    let (file_path, size_bytes) =
        parse_backup_result(&result).ok_or_else(|| OperationError::BadResult(result.clone()))?;

    let record = BackupRecord {
        id: Uuid::new_v4().to_string(),
        instance_id: instance_id.to_string(),
        kind,
        file_path,
        size_bytes,
        note: note.to_string(),
        created_at: OffsetDateTime::now_utc(),
    };
    state.store.insert_backup(record.clone())?;
    audit(state, Some(&node.id), Some(instance_id), "backup", &record.file_path, true);
    if let Err(e) = state.store.flush() {
        warn!("[backups] failed to persist fleet: {e}");
    }
    Ok(record)
}

/// Une passe de sauvegarde automatique, séquentielle ; retourne le nombre de succès
pub async fn run_auto_backups(state: &KernelState) -> usize {
    let timeout = Duration::from_secs(state.config.auto_backup.timeout_secs);
    let running: Vec<String> = state
        .store
        .list_instances(None)
        .into_iter()
        .filter(|i| i.status == InstanceStatus::Running)
        .map(|i| i.id)
        .collect();

    let mut done = 0;
    for instance_id in running {
        match create_backup(state, &instance_id, "", BackupKind::Auto, timeout).await {
            Ok(record) => {
                info!("[backups] auto backup of {instance_id}: {} ({} bytes)", record.file_path, record.size_bytes);
                done += 1;
            }
            Err(e) => warn!("[backups] auto backup of {instance_id} failed: {e}"),
        }
    }
    done
}

pub fn spawn_auto_backups(state: KernelState) {
    let conf = state.config.auto_backup.clone();
    if !conf.enabled || conf.interval_hours == 0 {
        info!("[backups] automatic backups disabled");
        return;
    }
    let period = Duration::from_secs(conf.interval_hours * 3600);
    info!("[backups] automatic backups every {}h", conf.interval_hours);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            let done = run_auto_backups(&state).await;
            info!("[backups] auto backup pass finished: {done} archive(s)");
        }
    });
}
