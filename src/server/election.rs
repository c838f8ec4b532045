//! The election timer actor (SPEC_FULL.md §4.2): a dedicated thread that
//! fires `Server::on_election_timeout` after a randomized interval, and can
//! be reset (restart the countdown) or stopped (pause, no fire, stays
//! parked until reset again) without tearing down the thread. Generalizes
//! the teacher's heartbeat-via-channel-timeout pattern in `server::peer` to
//! a standalone timer actor, since this spec drives both the follower's
//! election deadline and the leader's broadcast ticker (`replication.rs`)
//! the same way.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use rand::Rng;

use super::{Server, ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN};

pub enum TimerCommand {
    /// Restart the countdown with a fresh random interval.
    Reset,
    /// Cancel the countdown without firing; stays parked until `Reset`.
    Stop,
    /// Terminate the actor thread for good.
    Shutdown,
}

pub struct ElectionHandle {
    tx: Sender<TimerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl ElectionHandle {
    pub fn start(server: Weak<Server>) -> ElectionHandle {
        let (tx, rx) = channel();
        let thread = thread::spawn(move || election_loop(server, rx));
        ElectionHandle { tx, thread: Some(thread) }
    }

    pub fn reset(&self) {
        let _ = self.tx.send(TimerCommand::Reset);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(TimerCommand::Stop);
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn random_timeout() -> std::time::Duration {
    let min = ELECTION_TIMEOUT_MIN.as_millis() as u64;
    let max = ELECTION_TIMEOUT_MAX.as_millis() as u64;
    std::time::Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

fn election_loop(server: Weak<Server>, rx: std::sync::mpsc::Receiver<TimerCommand>) {
    'parked: loop {
        match rx.recv() {
            Ok(TimerCommand::Reset) => {}
            Ok(TimerCommand::Stop) => continue 'parked,
            Ok(TimerCommand::Shutdown) | Err(_) => return,
        }
        loop {
            match rx.recv_timeout(random_timeout()) {
                Ok(TimerCommand::Reset) => continue,
                Ok(TimerCommand::Stop) => continue 'parked,
                Ok(TimerCommand::Shutdown) => return,
                Err(RecvTimeoutError::Timeout) => {
                    let Some(server) = server.upgrade() else { return };
                    server.on_election_timeout();
                    continue 'parked;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
