//! The inbound peer RPC listener (SPEC_FULL.md §4.8). One `TcpListener`
//! accepts a connection per RPC: read one request line, dispatch, write one
//! reply line, close. Generalizes the teacher's `mio`-driven event loop
//! (`server::peer`'s `EventedFn` handlers) to a thread-per-connection model,
//! which this spec's request/reply RPC shape does not need an event loop
//! for.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};

use crate::rpc::Message;
use crate::server::Server;

pub fn serve(listener: TcpListener, server: Arc<Server>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let server = Arc::clone(&server);
                thread::spawn(move || handle_connection(stream, server));
            }
            Err(e) => warn!("peer listener accept error: {e}"),
        }
    }
}

fn handle_connection(stream: TcpStream, server: Arc<Server>) {
    let peer_addr = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream.try_clone().expect("clone tcp stream for reply"));
    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }
    let message = match Message::decode(&line) {
        Ok(message) => message,
        Err(e) => {
            debug!("malformed peer message from {peer_addr:?}: {e}");
            return;
        }
    };
    if let Some(reply) = server.dispatch(message) {
        let mut stream = stream;
        let _ = stream.write_all(format!("{}\n", reply.encode()).as_bytes());
    }
}
