//! The replicated operation log: an in-memory, 1-indexed, append-only
//! sequence of client commands. Whole log values are shipped wholesale
//! during view change and recovery; there is no durable persistence.

use serde::{Deserialize, Serialize};

use sha2::{Digest, Sha256};

use crate::statemach::Command;
use crate::utils::CanopyError;

/// In-memory log of commands, indexed from 1. Public because whole logs
/// ride inside the peer wire messages; its operations stay crate-internal.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct OpLog {
    entries: Vec<Command>,
}

impl OpLog {
    /// Creates an empty log.
    pub(crate) fn new() -> Self {
        OpLog { entries: vec![] }
    }

    /// Highest index appended so far (0 if empty).
    pub(crate) fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Appends the command at given index, which must be exactly one past
    /// the current highest index.
    pub(crate) fn append(
        &mut self,
        index: u64,
        cmd: Command,
    ) -> Result<(), CanopyError> {
        if index != self.len() + 1 {
            return Err(CanopyError(format!(
                "append index {} but log length {}",
                index,
                self.len()
            )));
        }
        self.entries.push(cmd);
        Ok(())
    }

    /// Gets the command at given 1-based index.
    pub(crate) fn get(&self, index: u64) -> Option<&Command> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Hex SHA-256 digest over the canonical encoding of the whole log,
    /// used for divergence checks across replicas.
    pub(crate) fn digest(&self) -> Result<String, CanopyError> {
        let bytes = rmp_serde::encode::to_vec(&self.entries)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[cfg(test)]
mod oplog_tests {
    use super::*;

    fn push_cmd(i: u64) -> Command {
        Command::Push {
            value: format!("m{}", i),
        }
    }

    #[test]
    fn append_get() -> Result<(), CanopyError> {
        let mut log = OpLog::new();
        assert_eq!(log.len(), 0);
        assert!(log.get(0).is_none());
        assert!(log.get(1).is_none());

        log.append(1, push_cmd(1))?;
        log.append(2, push_cmd(2))?;
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(1), Some(&push_cmd(1)));
        assert_eq!(log.get(2), Some(&push_cmd(2)));
        Ok(())
    }

    #[test]
    fn append_gap_rejected() -> Result<(), CanopyError> {
        let mut log = OpLog::new();
        assert!(log.append(2, push_cmd(2)).is_err());
        log.append(1, push_cmd(1))?;
        assert!(log.append(1, push_cmd(1)).is_err());
        assert!(log.append(3, push_cmd(3)).is_err());
        Ok(())
    }

    #[test]
    fn digest_agreement() -> Result<(), CanopyError> {
        let mut log1 = OpLog::new();
        let mut log2 = OpLog::new();
        for i in 1..=5 {
            log1.append(i, push_cmd(i))?;
            log2.append(i, push_cmd(i))?;
        }
        assert_eq!(log1.digest()?, log2.digest()?);

        log2.append(6, push_cmd(99))?;
        assert_ne!(log1.digest()?, log2.digest()?);
        Ok(())
    }
}
