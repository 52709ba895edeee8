use serde::{Deserialize, Serialize};

/// Trading venue a position lives on.
///
/// `Testnet` is the paper venue TRIAL accounts are routed to; every other
/// variant is a live venue with real funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Kraken,
    Testnet,
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Kraken => "kraken",
            Exchange::Testnet => "testnet",
        }
    }

    /// True for venues that move real funds.
    pub fn is_live(&self) -> bool {
        !matches!(self, Exchange::Testnet)
    }

    pub fn parse(name: &str) -> Option<Exchange> {
        match name.to_ascii_lowercase().as_str() {
            "binance" => Some(Exchange::Binance),
            "bybit" => Some(Exchange::Bybit),
            "kraken" => Some(Exchange::Kraken),
            "testnet" => Some(Exchange::Testnet),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
