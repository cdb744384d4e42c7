//! Network definitions

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Public test network
    Testnet,
    /// Local node (development)
    Regtest,
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" | "local" => Ok(Self::Regtest),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Ticker shown to users
    pub coin_symbol: &'static str,
    /// Remote node RPC base URLs (each ends with `/`)
    pub node_urls: &'static [&'static str],
    /// Alias service base URL (ends with `/`)
    pub alias_api_url: &'static str,
    /// Prefix of the OpenAlias TXT record (`oa1:<prefix>`)
    pub openalias_prefix: &'static str,
}

const TESTNET_NODES: &[&str] = &[
    "https://testnet.myqwertycoin.com/sslnode/",
    "https://testnet.myqwertycoin.com/api/?mode=get&url=http://node-00.testnet.qwertycoin.org:8197/",
    "https://testnet.myqwertycoin.com/api/?mode=get&url=http://node-01.testnet.qwertycoin.org:8197/",
];

const REGTEST_NODES: &[&str] = &["http://127.0.0.1:8197/"];

impl Network {
    /// Get testnet parameters
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            coin_symbol: "QWC",
            node_urls: TESTNET_NODES,
            alias_api_url: "https://01-cache.testnet.myqwertycoin.com/",
            openalias_prefix: "qwc",
        }
    }

    /// Get regtest parameters
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            coin_symbol: "QWC",
            node_urls: REGTEST_NODES,
            alias_api_url: "http://127.0.0.1:8080/",
            openalias_prefix: "qwc",
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Node URLs as owned strings
    pub fn node_url_list(&self) -> Vec<String> {
        self.node_urls.iter().map(|url| url.to_string()).collect()
    }
}
