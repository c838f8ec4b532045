//! The leader's broadcast ticker (SPEC_FULL.md §4.2/§9). A dedicated thread
//! that periodically triggers `Server::replicate_to_all_peers`, started the
//! moment a node becomes leader and stopped (joined) the moment it steps
//! down -- its lifetime is scoped exactly to holding leadership, resolving
//! the REDESIGN FLAGS note about a heartbeat ticker racing or overlapping
//! across role transitions. Structurally this is the same actor shape as
//! `election::ElectionHandle`, just without a reset/stop distinction: a
//! leader's ticker runs continuously for as long as the handle is alive.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use super::{Server, BROADCAST_PERIOD};

pub struct ReplicatorHandle {
    // Held only so `Drop` can take and drop it, disconnecting the channel to
    // wake the thread out of `recv_timeout` immediately instead of waiting
    // out the rest of the current broadcast period.
    tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ReplicatorHandle {
    pub fn start(server: Weak<Server>) -> ReplicatorHandle {
        let (tx, rx) = channel::<()>();
        let thread = thread::spawn(move || loop {
            match rx.recv_timeout(BROADCAST_PERIOD) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {
                    let Some(server) = server.upgrade() else { return };
                    server.replicate_to_all_peers();
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        });
        ReplicatorHandle { tx: Some(tx), thread: Some(thread) }
    }
}

impl Drop for ReplicatorHandle {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
