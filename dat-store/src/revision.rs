//! Content-derived revision tokens.

use std::{fmt, str::FromStr};

use data_encoding::HEXLOWER;
use serde_with::{DeserializeFromStr, SerializeDisplay};

const HASH_LEN: usize = 16;

/// Marks one revision in the successor chain of a row.
///
/// The token is derived from the prior token (if any) and the row content, never
/// from the clock: writing the same content on top of the same history always yields
/// the same token. The generation counts the revisions in the chain, so a successor
/// always sorts after its predecessor.
///
/// Renders as `<generation>-<hash>`, e.g. `2-3f1c..`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct RevisionToken {
    generation: u64,
    hash: [u8; HASH_LEN],
}

impl RevisionToken {
    /// The token of the first revision of a row with the given content.
    pub fn initial(value: &[u8]) -> Self {
        Self::derive(1, None, value)
    }

    /// The token of the revision that replaces `self` with new content.
    pub fn successor(&self, value: &[u8]) -> Self {
        Self::derive(self.generation + 1, Some(self), value)
    }

    /// Position of this revision in the row's history, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn derive(generation: u64, prior: Option<&Self>, value: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        if let Some(prior) = prior {
            hasher.update(prior.to_string().as_bytes());
        }
        hasher.update(value);
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&hasher.finalize().as_bytes()[..HASH_LEN]);
        Self { generation, hash }
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, HEXLOWER.encode(&self.hash))
    }
}

impl fmt::Debug for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionToken({self})")
    }
}

/// Error parsing a [`RevisionToken`] from its string form.
#[derive(Debug, thiserror::Error)]
#[error("invalid revision token: {0:?}")]
pub struct ParseRevisionError(String);

impl FromStr for RevisionToken {
    type Err = ParseRevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRevisionError(s.to_string());
        let (generation, hash) = s.split_once('-').ok_or_else(err)?;
        let generation: u64 = generation.parse().map_err(|_| err())?;
        if generation == 0 {
            return Err(err());
        }
        let hash = HEXLOWER.decode(hash.as_bytes()).map_err(|_| err())?;
        let hash: [u8; HASH_LEN] = hash.try_into().map_err(|_| err())?;
        Ok(Self { generation, hash })
    }
}
