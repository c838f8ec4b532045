//! The replicated log and its durable backing store.
//!
//! `Log` is the in-memory, append-only sequence of `LogEntry`s that every
//! node holds. `StateStore` is the durable side of a node: the
//! `(currentTerm, votedFor, commitLength)` triple plus the log file itself.
//! Mirrors the teacher's `server::log` module, generalized to the text
//! encoding this spec mandates instead of capnp.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::RaftError;

pub type Term = u64;

/// Every `STATE_COMPACTION_INTERVAL` persisted updates, the state file is
/// rewritten down to a single line instead of appended to forever (REDESIGN
/// FLAGS, SPEC_FULL.md §4.1/§9).
const STATE_COMPACTION_INTERVAL: u64 = 256;

/// A single entry in the replicated log: a command string and the term in
/// which a leader appended it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub command: String,
    pub term: Term,
}

impl LogEntry {
    pub fn new(command: impl Into<String>, term: Term) -> Self {
        LogEntry {
            command: command.into(),
            term,
        }
    }

    /// Encodes as `"<command>#<term>"`. Panics if `command` contains `#`,
    /// since that would corrupt decoding; callers are expected to have
    /// validated the command already (see `kv::Command::parse`).
    pub fn encode(&self) -> String {
        debug_assert!(!self.command.contains('#'), "command must not contain '#'");
        format!("{}#{}", self.command, self.term)
    }

    pub fn decode(line: &str) -> Result<Self, RaftError> {
        let (command, term) = line
            .rsplit_once('#')
            .ok_or_else(|| RaftError::MalformedMessage(line.to_string()))?;
        let term = term
            .parse()
            .map_err(|_| RaftError::MalformedMessage(line.to_string()))?;
        Ok(LogEntry {
            command: command.to_string(),
            term,
        })
    }
}

/// The in-memory replicated log. Entries are appended to the tail only;
/// `truncate_to` is the sole way entries are removed, and only ever removes
/// an uncommitted tail (see `Server::handle_log_request`).
#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of entry at 1-based `index`, or `0` if `index == 0` (no entry).
    pub fn term_at(&self, index: usize) -> Term {
        if index == 0 {
            0
        } else {
            self.entries[index - 1].term
        }
    }

    pub fn last_term(&self) -> Term {
        self.term_at(self.entries.len())
    }

    pub fn entry(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index - 1)
    }

    /// All entries from 1-based `from` (inclusive) to the end.
    pub fn suffix_from(&self, from: usize) -> &[LogEntry] {
        &self.entries[from.min(self.entries.len())..]
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Keeps only the first `len` entries, discarding the (uncommitted) tail.
    pub fn truncate_to(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    /// `logOk` test used by both the voter (§4.4) and the follower's
    /// append-entries acceptance (§4.3), parameterized over which pair of
    /// (length, term) is being compared.
    pub fn is_at_least_as_up_to_date_as(&self, candidate_log_length: usize, candidate_log_term: Term) -> bool {
        let own_last_term = self.last_term();
        candidate_log_term > own_last_term
            || (candidate_log_term == own_last_term && candidate_log_length >= self.entries.len())
    }
}

/// `(currentTerm, votedFor, commitLength)`, loaded once at startup and
/// rewritten on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTriple {
    pub current_term: Term,
    pub voted_for: Option<String>,
    pub commit_length: usize,
}

impl StateTriple {
    pub fn initial() -> Self {
        StateTriple {
            current_term: 0,
            voted_for: None,
            commit_length: 0,
        }
    }

    fn encode(&self, node_id: &str) -> String {
        format!(
            "{},{},{},{}",
            node_id,
            self.current_term,
            self.voted_for.as_deref().unwrap_or(""),
            self.commit_length
        )
    }

    fn decode(line: &str) -> Option<(String, Self)> {
        let mut parts = line.splitn(4, ',');
        let node_id = parts.next()?.to_string();
        let current_term: Term = parts.next()?.parse().ok()?;
        let voted_for_raw = parts.next()?;
        let voted_for = if voted_for_raw.is_empty() {
            None
        } else {
            Some(voted_for_raw.to_string())
        };
        let commit_length: usize = parts.next()?.parse().ok()?;
        Some((
            node_id,
            StateTriple {
                current_term,
                voted_for,
                commit_length,
            },
        ))
    }
}

/// Durable record of `(currentTerm, votedFor, commitLength)` plus the
/// append-only log file, scoped to a single node id.
pub struct StateStore {
    node_id: String,
    state_path: PathBuf,
    log_path: PathBuf,
    updates_since_compaction: u64,
}

impl StateStore {
    pub fn new(data_dir: &Path, node_id: &str) -> io::Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(StateStore {
            node_id: node_id.to_string(),
            state_path: data_dir.join(format!("{node_id}.state")),
            log_path: data_dir.join(format!("{node_id}.log")),
            updates_since_compaction: 0,
        })
    }

    /// Reads the state file (last line matching this node's id wins) and
    /// rebuilds the log by replaying the log file in order. Absent files
    /// yield the zero state and an empty log.
    pub fn load_or_init(&self) -> Result<(StateTriple, Log), RaftError> {
        let state = self.read_latest_state()?.unwrap_or_else(StateTriple::initial);
        let log = self.rebuild_log()?;
        Ok((state, log))
    }

    fn read_latest_state(&self) -> Result<Option<StateTriple>, RaftError> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.state_path)?;
        let mut latest = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some((id, triple)) = StateTriple::decode(&line) {
                if id == self.node_id {
                    latest = Some(triple);
                }
            }
        }
        Ok(latest)
    }

    fn rebuild_log(&self) -> Result<Log, RaftError> {
        let mut log = Log::new();
        if !self.log_path.exists() {
            return Ok(log);
        }
        let file = File::open(&self.log_path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            log.push(LogEntry::decode(&line)?);
        }
        Ok(log)
    }

    /// Durably records `(currentTerm, votedFor, commitLength)`. Must be
    /// called, and complete, before any outbound RPC that asserts these
    /// values (SPEC_FULL.md §4.1).
    pub fn persist(&mut self, state: &StateTriple) -> Result<(), RaftError> {
        let line = format!("{}\n", state.encode(&self.node_id));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.state_path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.updates_since_compaction += 1;
        if self.updates_since_compaction >= STATE_COMPACTION_INTERVAL {
            self.compact(state)?;
        }
        Ok(())
    }

    /// Rewrites the state file down to a single line holding `state`,
    /// write-tmp-then-rename so a crash mid-compaction never loses the
    /// previously-durable state (REDESIGN FLAGS, SPEC_FULL.md §9).
    fn compact(&mut self, state: &StateTriple) -> Result<(), RaftError> {
        let tmp_path = self.state_path.with_extension("state.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(format!("{}\n", state.encode(&self.node_id)).as_bytes())?;
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.state_path)?;
        self.updates_since_compaction = 0;
        Ok(())
    }

    /// Durably appends one `"command#term"` line to the log file.
    pub fn append_log_record(&mut self, entry: &LogEntry) -> Result<(), RaftError> {
        let line = format!("{}\n", entry.encode());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_through_encode_decode() {
        let entry = LogEntry::new("SET x 7", 3);
        let decoded = LogEntry::decode(&entry.encode()).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn decode_rejects_missing_separator() {
        assert!(LogEntry::decode("SET x 7").is_err());
    }

    #[test]
    fn log_matching_prefix_terms() {
        let mut log = Log::new();
        log.push(LogEntry::new("SET a 1", 1));
        log.push(LogEntry::new("SET b 2", 1));
        log.push(LogEntry::new("SET c 3", 2));
        assert_eq!(log.term_at(0), 0);
        assert_eq!(log.term_at(2), 1);
        assert_eq!(log.term_at(3), 2);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn suffix_from_end_is_empty() {
        let mut log = Log::new();
        log.push(LogEntry::new("SET a 1", 1));
        assert!(log.suffix_from(1).is_empty());
        assert_eq!(log.suffix_from(0).len(), 1);
    }

    #[test]
    fn truncate_discards_uncommitted_tail() {
        let mut log = Log::new();
        log.push(LogEntry::new("SET a 1", 1));
        log.push(LogEntry::new("SET b 2", 1));
        log.truncate_to(1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.entry(1).unwrap().command, "SET a 1");
    }

    #[test]
    fn candidate_log_strictly_shorter_cannot_win() {
        let mut log = Log::new();
        log.push(LogEntry::new("SET a 1", 2));
        log.push(LogEntry::new("SET b 2", 2));
        // Candidate at same last term but shorter log is not "at least as up to date".
        assert!(!log.is_at_least_as_up_to_date_as(1, 2));
        assert!(log.is_at_least_as_up_to_date_as(2, 2));
        assert!(log.is_at_least_as_up_to_date_as(0, 3));
    }

    #[test]
    fn state_triple_round_trips() {
        let triple = StateTriple {
            current_term: 5,
            voted_for: Some("b".to_string()),
            commit_length: 2,
        };
        let line = triple.encode("a");
        let (id, decoded) = StateTriple::decode(&line).unwrap();
        assert_eq!(id, "a");
        assert_eq!(decoded, triple);
    }

    #[test]
    fn state_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path(), "a").unwrap();
        let entry = LogEntry::new("SET x 7", 1);
        store.append_log_record(&entry).unwrap();
        let state = StateTriple {
            current_term: 1,
            voted_for: Some("a".to_string()),
            commit_length: 1,
        };
        store.persist(&state).unwrap();

        let store2 = StateStore::new(dir.path(), "a").unwrap();
        let (loaded_state, loaded_log) = store2.load_or_init().unwrap();
        assert_eq!(loaded_state, state);
        assert_eq!(loaded_log.len(), 1);
        assert_eq!(loaded_log.entry(1).unwrap(), &entry);
    }

    #[test]
    fn state_store_takes_last_line_for_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path(), "a").unwrap();
        store
            .persist(&StateTriple {
                current_term: 1,
                voted_for: None,
                commit_length: 0,
            })
            .unwrap();
        store
            .persist(&StateTriple {
                current_term: 2,
                voted_for: Some("a".to_string()),
                commit_length: 1,
            })
            .unwrap();
        let (state, _) = store.load_or_init().unwrap();
        assert_eq!(state.current_term, 2);
        assert_eq!(state.commit_length, 1);
    }

    #[test]
    fn compaction_keeps_latest_state_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path(), "a").unwrap();
        for term in 1..=(STATE_COMPACTION_INTERVAL + 5) {
            store
                .persist(&StateTriple {
                    current_term: term,
                    voted_for: None,
                    commit_length: 0,
                })
                .unwrap();
        }
        let (state, _) = store.load_or_init().unwrap();
        assert_eq!(state.current_term, STATE_COMPACTION_INTERVAL + 5);
    }
}
