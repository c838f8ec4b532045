//! The text-framed peer RPC message model (SPEC_FULL.md §6). Generalizes
//! the teacher's capnp-schema request/reply pair (`raft_capnp::{append_entries,
//! request_vote, ...}`) to the plain-text grammar this spec mandates: one
//! space-delimited line per message, with the `LogRequest` suffix list
//! `;`-joined since its entries may themselves contain spaces.

use crate::error::RaftError;
use crate::log::{LogEntry, Term};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    VoteRequest {
        candidate_id: String,
        term: Term,
        log_length: usize,
        last_log_term: Term,
    },
    VoteResponse {
        node_id: String,
        term: Term,
        granted: bool,
    },
    LogRequest {
        leader_id: String,
        term: Term,
        prefix_length: usize,
        prefix_term: Term,
        commit_length: usize,
        suffix: Vec<LogEntry>,
    },
    LogResponse {
        node_id: String,
        port: u16,
        term: Term,
        ack: usize,
        success: bool,
    },
}

impl Message {
    pub fn encode(&self) -> String {
        match self {
            Message::VoteRequest {
                candidate_id,
                term,
                log_length,
                last_log_term,
            } => format!("VoteRequest {candidate_id} {term} {log_length} {last_log_term}"),
            Message::VoteResponse { node_id, term, granted } => {
                format!("VoteResponse {node_id} {term} {}", *granted as u8)
            }
            Message::LogRequest {
                leader_id,
                term,
                prefix_length,
                prefix_term,
                commit_length,
                suffix,
            } => {
                let suffix_str = suffix
                    .iter()
                    .map(LogEntry::encode)
                    .collect::<Vec<_>>()
                    .join(";");
                format!(
                    "LogRequest {leader_id} {term} {prefix_length} {prefix_term} {commit_length} {} {suffix_str}",
                    suffix.len()
                )
            }
            Message::LogResponse {
                node_id,
                port,
                term,
                ack,
                success,
            } => format!("LogResponse {node_id} {port} {term} {ack} {}", *success as u8),
        }
    }

    pub fn decode(line: &str) -> Result<Self, RaftError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(2, ' ');
        let kind = parts
            .next()
            .ok_or_else(|| RaftError::MalformedMessage(line.to_string()))?;
        let rest = parts.next().unwrap_or("");
        match kind {
            "VoteRequest" => {
                let f: Vec<&str> = rest.split(' ').collect();
                let [candidate_id, term, log_length, last_log_term] = take4(&f, line)?;
                Ok(Message::VoteRequest {
                    candidate_id: candidate_id.to_string(),
                    term: parse(term, line)?,
                    log_length: parse(log_length, line)?,
                    last_log_term: parse(last_log_term, line)?,
                })
            }
            "VoteResponse" => {
                let f: Vec<&str> = rest.split(' ').collect();
                let [node_id, term, granted] = take3(&f, line)?;
                Ok(Message::VoteResponse {
                    node_id: node_id.to_string(),
                    term: parse(term, line)?,
                    granted: parse::<u8>(granted, line)? != 0,
                })
            }
            "LogRequest" => {
                // leader_id term prefix_length prefix_term commit_length suffix_count [suffix]
                let mut f = rest.splitn(6, ' ');
                let leader_id = f.next().ok_or_else(|| malformed(line))?;
                let term = f.next().ok_or_else(|| malformed(line))?;
                let prefix_length = f.next().ok_or_else(|| malformed(line))?;
                let prefix_term = f.next().ok_or_else(|| malformed(line))?;
                let commit_length = f.next().ok_or_else(|| malformed(line))?;
                let suffix_count = f.next().ok_or_else(|| malformed(line))?;
                let rest_suffix = f.next().unwrap_or("");
                let suffix_count: usize = parse(suffix_count, line)?;
                let suffix = if suffix_count == 0 {
                    Vec::new()
                } else {
                    rest_suffix
                        .split(';')
                        .map(LogEntry::decode)
                        .collect::<Result<Vec<_>, _>>()?
                };
                if suffix.len() != suffix_count {
                    return Err(malformed(line));
                }
                Ok(Message::LogRequest {
                    leader_id: leader_id.to_string(),
                    term: parse(term, line)?,
                    prefix_length: parse(prefix_length, line)?,
                    prefix_term: parse(prefix_term, line)?,
                    commit_length: parse(commit_length, line)?,
                    suffix,
                })
            }
            "LogResponse" => {
                let f: Vec<&str> = rest.split(' ').collect();
                let [node_id, port, term, ack, success] = take5(&f, line)?;
                Ok(Message::LogResponse {
                    node_id: node_id.to_string(),
                    port: parse(port, line)?,
                    term: parse(term, line)?,
                    ack: parse(ack, line)?,
                    success: parse::<u8>(success, line)? != 0,
                })
            }
            _ => Err(malformed(line)),
        }
    }
}

fn malformed(line: &str) -> RaftError {
    RaftError::MalformedMessage(line.to_string())
}

fn parse<T: std::str::FromStr>(field: &str, line: &str) -> Result<T, RaftError> {
    field.parse().map_err(|_| malformed(line))
}

fn take3<'a>(fields: &[&'a str], line: &str) -> Result<[&'a str; 3], RaftError> {
    fields.try_into().map_err(|_| malformed(line))
}

fn take4<'a>(fields: &[&'a str], line: &str) -> Result<[&'a str; 4], RaftError> {
    fields.try_into().map_err(|_| malformed(line))
}

fn take5<'a>(fields: &[&'a str], line: &str) -> Result<[&'a str; 5], RaftError> {
    fields.try_into().map_err(|_| malformed(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_request_round_trips() {
        let msg = Message::VoteRequest {
            candidate_id: "a".to_string(),
            term: 3,
            log_length: 5,
            last_log_term: 2,
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn vote_response_round_trips() {
        let msg = Message::VoteResponse {
            node_id: "b".to_string(),
            term: 9,
            granted: true,
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);

        let msg = Message::VoteResponse {
            node_id: "b".to_string(),
            term: 9,
            granted: false,
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn log_request_with_empty_suffix_is_a_heartbeat() {
        let msg = Message::LogRequest {
            leader_id: "a".to_string(),
            term: 4,
            prefix_length: 2,
            prefix_term: 3,
            commit_length: 2,
            suffix: vec![],
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn log_request_with_suffix_round_trips() {
        let msg = Message::LogRequest {
            leader_id: "a".to_string(),
            term: 4,
            prefix_length: 1,
            prefix_term: 1,
            commit_length: 1,
            suffix: vec![LogEntry::new("SET x 7", 1), LogEntry::new("DELETE y", 2)],
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn log_response_round_trips() {
        let msg = Message::LogResponse {
            node_id: "c".to_string(),
            port: 9001,
            term: 2,
            ack: 3,
            success: true,
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        assert!(Message::decode("Bogus a b c").is_err());
    }

    #[test]
    fn decode_rejects_truncated_fields() {
        assert!(Message::decode("VoteRequest a 1").is_err());
    }
}
