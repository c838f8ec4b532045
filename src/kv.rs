//! The Applier: the deterministic key-value state machine that consumes
//! committed log entries in order (SPEC_FULL.md §4.6). Serving `GET` from
//! here without consensus means read-your-writes is not guaranteed across
//! a leader failover -- a documented staleness trade-off, not a bug.

use std::collections::HashMap;

use crate::error::CommandError;

/// A parsed, already-validated client command. Only `Set`/`Delete` are ever
/// logged (SPEC_FULL.md §6); `Get` is served locally and never replicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: i64 },
    Delete { key: String },
    Get { key: String },
}

impl Command {
    /// Parses and validates a raw client command string. This is the single
    /// point where malformed commands are rejected (SPEC_FULL.md §7): once a
    /// `Set`/`Delete` passes here it is safe to log, replicate, and apply
    /// unconditionally.
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        match tokens.as_slice() {
            ["GET", key] => {
                validate_key(key)?;
                Ok(Command::Get { key: key.to_string() })
            }
            ["DELETE", key] => {
                validate_key(key)?;
                Ok(Command::Delete { key: key.to_string() })
            }
            ["SET", key, value] => {
                validate_key(key)?;
                let value: i64 = value.parse().map_err(|_| CommandError::NotAnInteger)?;
                Ok(Command::Set {
                    key: key.to_string(),
                    value,
                })
            }
            ["GET"] | ["DELETE"] => Err(CommandError::MissingKey),
            ["SET"] | ["SET", _] => Err(CommandError::MissingValue),
            _ => Err(CommandError::UnknownOperation),
        }
    }

    /// Re-renders the command as the canonical string stored in the log
    /// (e.g. `"SET x 7"`), the inverse of `parse` for `Set`/`Delete`.
    pub fn to_log_command(&self) -> String {
        match self {
            Command::Set { key, value } => format!("SET {key} {value}"),
            Command::Delete { key } => format!("DELETE {key}"),
            Command::Get { key } => format!("GET {key}"),
        }
    }
}

fn validate_key(key: &str) -> Result<(), CommandError> {
    if key.contains('#') || key.contains(';') {
        Err(CommandError::ReservedCharacter)
    } else {
        Ok(())
    }
}

/// The apply-only KV sink. Every method here is infallible in the sense that
/// it never rejects a command -- rejection happens once, at `Command::parse`
/// time, before a command is ever admitted to the replicated log.
#[derive(Debug, Default)]
pub struct Applier {
    store: HashMap<String, i64>,
}

impl Applier {
    pub fn new() -> Self {
        Applier { store: HashMap::new() }
    }

    /// Applies one already-logged command string (e.g. `"SET x 7"`). Panics
    /// only if `command` is not one of the three grammar forms, which cannot
    /// happen for anything that passed `Command::parse` before being logged.
    pub fn apply(&mut self, command: &str) {
        match Command::parse(command).expect("logged commands are always well-formed") {
            Command::Set { key, value } => {
                self.store.insert(key, value);
            }
            Command::Delete { key } => {
                self.store.remove(&key);
            }
            Command::Get { .. } => {
                // GETs are never logged (SPEC_FULL.md §6); reaching here
                // would mean a GET slipped into the replicated log.
                unreachable!("GET commands are never appended to the log");
            }
        }
    }

    /// Serves a `GET` directly from local state, without consensus.
    pub fn get(&self, key: &str) -> Result<i64, CommandError> {
        self.store.get(key).copied().ok_or(CommandError::KeyNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_get_delete() {
        assert_eq!(
            Command::parse("SET x 7").unwrap(),
            Command::Set {
                key: "x".to_string(),
                value: 7
            }
        );
        assert_eq!(
            Command::parse("GET x").unwrap(),
            Command::Get { key: "x".to_string() }
        );
        assert_eq!(
            Command::parse("DELETE x").unwrap(),
            Command::Delete { key: "x".to_string() }
        );
    }

    #[test]
    fn rejects_non_integer_set_value() {
        assert!(matches!(
            Command::parse("SET x abc"),
            Err(CommandError::NotAnInteger)
        ));
    }

    #[test]
    fn rejects_missing_key() {
        assert!(matches!(Command::parse("GET"), Err(CommandError::MissingKey)));
    }

    #[test]
    fn rejects_unknown_operation() {
        assert!(matches!(
            Command::parse("FROBNICATE x"),
            Err(CommandError::UnknownOperation)
        ));
    }

    #[test]
    fn rejects_reserved_characters_in_key() {
        assert!(matches!(
            Command::parse("SET x#y 1"),
            Err(CommandError::ReservedCharacter)
        ));
    }

    #[test]
    fn apply_set_then_get_round_trips() {
        let mut applier = Applier::new();
        applier.apply("SET x 7");
        assert_eq!(applier.get("x").unwrap(), 7);
    }

    #[test]
    fn apply_delete_removes_key() {
        let mut applier = Applier::new();
        applier.apply("SET x 7");
        applier.apply("DELETE x");
        assert!(matches!(applier.get("x"), Err(CommandError::KeyNotFound)));
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let applier = Applier::new();
        assert!(matches!(applier.get("missing"), Err(CommandError::KeyNotFound)));
    }
}
