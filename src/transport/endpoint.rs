use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::{MqError, Result};

/// One configured broker address with its load-balancing weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub weight: u32,
}

impl Endpoint {
    pub const DEFAULT_WEIGHT: u32 = 1;

    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            weight: Self::DEFAULT_WEIGHT,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Parse `host:port` or `host:port:weight`. IPv6 hosts are bracketed,
    /// as in `[::1]:9999:2`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || MqError::InvalidEndpoint(s.to_string());
        let trimmed = s.trim();
        let (address, rest) = match trimmed.strip_prefix('[') {
            Some(bracketed) => {
                let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
                (host, rest.strip_prefix(':').ok_or_else(invalid)?)
            }
            None => trimmed.split_once(':').ok_or_else(invalid)?,
        };
        let parts: Vec<&str> = rest.split(':').collect();
        let (port, weight) = match parts.as_slice() {
            [port] => (*port, None),
            [port, weight] => (*port, Some(*weight)),
            _ => return Err(invalid()),
        };
        if address.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let weight = match weight {
            Some(w) => w.parse::<u32>().map_err(|_| invalid())?,
            None => Self::DEFAULT_WEIGHT,
        };
        Ok(Self::new(address, port).with_weight(weight))
    }

    /// Parse a comma separated endpoint list, skipping empty entries.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        let endpoints = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(MqError::InvalidEndpoint(s.to_string()));
        }
        Ok(endpoints)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}
