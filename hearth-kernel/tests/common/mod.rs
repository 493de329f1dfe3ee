#![allow(dead_code)]

use hearth_kernel::channel;
use hearth_kernel::config::KernelConfig;
use hearth_kernel::models::{Instance, Node};
use hearth_kernel::store::{FleetStore, MemoryStore, NewInstance};
use hearth_kernel::KernelState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Kernel sans HTTP : store en mémoire + canal de contrôle sur un port éphémère
pub async fn start_kernel(config: KernelConfig) -> (KernelState, SocketAddr) {
    hearth_devkit::init_logging();
    let state = KernelState::new(config, Arc::new(MemoryStore::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(channel::serve(listener, state.clone()));
    (state, addr)
}

pub fn add_node(state: &KernelState, name: &str) -> Node {
    state.store.create_node(name, "127.0.0.1").unwrap()
}

pub fn add_instance(state: &KernelState, node: &Node, name: &str) -> Instance {
    state
        .store
        .create_instance(NewInstance {
            node_id: node.id.clone(),
            name: name.to_string(),
            world_name: name.to_string(),
            password: "hunter22".to_string(),
            image: "lloesche/valheim-server:latest".to_string(),
            rcon_password: "rconpass".to_string(),
        })
        .unwrap()
}
