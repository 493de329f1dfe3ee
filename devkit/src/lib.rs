/*!
# Hearth DevKit - Doublures de test pour le canal de contrôle

Bibliothèque facilitant les tests du kernel Hearth avec:
- Un agent simulé (`MockAgent`) parlant le vrai protocole encadré
- Des helpers d'attente et d'initialisation des logs
*/

pub mod agent_stub;
pub mod test_utils;

pub use agent_stub::{node_info, running_report, MockAgent};
pub use test_utils::{init_logging, wait_until};
