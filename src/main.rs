//! The `raftkv-server` binary: parses startup configuration, brings up a
//! `Server`, and runs its two listeners (peer RPC, client HTTP) to
//! completion.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use log::{error, info};

use raftkv::config::Config;
use raftkv::server::Server;
use raftkv::{http, transport};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_args(std::env::args().skip(1))?;
    let registry = config.load_registry()?;

    let peer_port = registry
        .peer_port(&config.node_id)
        .expect("load_registry already checked this node id is registered");
    let client_port = config.client_port_override.unwrap_or(peer_port + 1);

    let server = Server::start(&config, registry)?;

    let peer_listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), peer_port))?;
    let client_listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), client_port))?;
    info!("{}: listening for peers on {peer_port}, clients on {client_port}", config.node_id);

    let transport_server = Arc::clone(&server);
    let transport_thread = std::thread::spawn(move || transport::serve(peer_listener, transport_server));

    http::serve(client_listener, server);
    let _ = transport_thread.join();
    Ok(())
}
