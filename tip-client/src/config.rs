//! Client-side description of the signer group.

use serde::{Deserialize, Serialize};

use crate::Error;

/// One signer: its base58-check identity and API base URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignerEntry {
    pub identity: String,
    pub api: String,
}

/// The group configuration a client signs against: the poly commitments
/// (whose length is the threshold) and the full signer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub commitments: Vec<String>,
    pub signers: Vec<SignerEntry>,
}

impl ClientConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let config: ClientConfig =
            serde_json::from_str(raw).map_err(|_| Error::InvalidConfig)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.commitments.is_empty()
            || self.signers.is_empty()
            || self.commitments.len() > self.signers.len()
        {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }

    /// The signing threshold, one commitment per polynomial coefficient.
    pub fn threshold(&self) -> usize {
        self.commitments.len()
    }
}
