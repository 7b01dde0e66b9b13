use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CoreError;

/// The six tradable assets. Stored as upper-case TEXT in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Ltc,
    Xrp,
    Sol,
    Link,
}

/// The five blockchains the custodian watches. LINK settles on ethereum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin,
    Ethereum,
    Litecoin,
    Xrp,
    Solana,
}

impl Asset {
    pub const ALL: [Asset; 6] = [
        Asset::Btc,
        Asset::Eth,
        Asset::Ltc,
        Asset::Xrp,
        Asset::Sol,
        Asset::Link,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Ltc => "LTC",
            Asset::Xrp => "XRP",
            Asset::Sol => "SOL",
            Asset::Link => "LINK",
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            Asset::Btc => Chain::Bitcoin,
            Asset::Eth | Asset::Link => Chain::Ethereum,
            Asset::Ltc => Chain::Litecoin,
            Asset::Xrp => Chain::Xrp,
            Asset::Sol => Chain::Solana,
        }
    }

    pub fn required_confirmations(&self) -> i32 {
        match self {
            Asset::Btc => 2,
            Asset::Eth | Asset::Link => 12,
            Asset::Ltc => 6,
            Asset::Xrp => 1,
            Asset::Sol => 32,
        }
    }

    /// Detections below this are silently dropped by the monitor.
    pub fn min_deposit(&self) -> Decimal {
        match self {
            Asset::Btc => dec!(0.0001),
            Asset::Eth => dec!(0.005),
            Asset::Ltc => dec!(0.01),
            Asset::Xrp => dec!(1),
            Asset::Sol => dec!(0.01),
            Asset::Link => dec!(0.1),
        }
    }

    /// Flat network fee charged on withdrawals; net = amount - fee.
    pub fn withdrawal_fee(&self) -> Decimal {
        match self {
            Asset::Btc => dec!(0.0002),
            Asset::Eth => dec!(0.002),
            Asset::Ltc => dec!(0.001),
            Asset::Xrp => dec!(0.25),
            Asset::Sol => dec!(0.001),
            Asset::Link => dec!(0.5),
        }
    }
}

impl FromStr for Asset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            "LTC" => Ok(Asset::Ltc),
            "XRP" => Ok(Asset::Xrp),
            "SOL" => Ok(Asset::Sol),
            "LINK" => Ok(Asset::Link),
            other => Err(CoreError::Validation(format!("unknown asset: {other}"))),
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Chain {
    pub const ALL: [Chain; 5] = [
        Chain::Bitcoin,
        Chain::Ethereum,
        Chain::Litecoin,
        Chain::Xrp,
        Chain::Solana,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Bitcoin => "bitcoin",
            Chain::Ethereum => "ethereum",
            Chain::Litecoin => "litecoin",
            Chain::Xrp => "xrp",
            Chain::Solana => "solana",
        }
    }

    pub fn assets(&self) -> &'static [Asset] {
        match self {
            Chain::Bitcoin => &[Asset::Btc],
            Chain::Ethereum => &[Asset::Eth, Asset::Link],
            Chain::Litecoin => &[Asset::Ltc],
            Chain::Xrp => &[Asset::Xrp],
            Chain::Solana => &[Asset::Sol],
        }
    }

    /// Only the ethereum scanner walks blocks with a cursor; the others ask
    /// their node for per-address history.
    pub fn uses_block_cursor(&self) -> bool {
        matches!(self, Chain::Ethereum)
    }
}

impl FromStr for Chain {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" => Ok(Chain::Bitcoin),
            "ethereum" => Ok(Chain::Ethereum),
            "litecoin" => Ok(Chain::Litecoin),
            "xrp" => Ok(Chain::Xrp),
            "solana" => Ok(Chain::Solana),
            other => Err(CoreError::Validation(format!("unknown chain: {other}"))),
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wallet the monitor asks a chain client to watch.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub wallet_id: Uuid,
    pub user_id: Uuid,
    pub address: String,
    pub destination_tag: Option<String>,
}

/// Inclusive block range for cursor-driven scans.
#[derive(Debug, Clone, Copy)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

/// An inbound transfer a chain client detected for one of our wallets,
/// already normalized to asset units with confirmations computed by the
/// chain's own rule.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub wallet_id: Uuid,
    pub user_id: Uuid,
    pub asset: Asset,
    pub tx_hash: String,
    pub amount: Decimal,
    pub confirmations: i32,
}

/// Outbound transaction to sign and submit.
#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub withdrawal_id: Uuid,
    pub asset: Asset,
    pub from_address: String,
    pub to_address: String,
    pub destination_tag: Option<String>,
    pub net_amount: Decimal,
}

/// Per-chain node access. Implementations live outside the core; the
/// contract each must honor:
///
/// - bitcoin/litecoin: per-address transaction lists, amount = sum of vouts
///   paying the address, confirmations = tip - block height + 1. Signing
///   selects UTXOs with vsize-based fee estimation and a 546-sat dust
///   threshold on change.
/// - ethereum: per-block transaction iteration filtered by recipient over
///   the supplied `BlockRange`; LINK via Transfer event logs on the token
///   contract with the recipient padded into topic 2; confirmations =
///   current block - tx block.
/// - xrp: validated account_tx Payments only, with an exact DestinationTag
///   match when the wallet carries one; validated means final.
/// - solana: signature history with pre/post balance delta for our account
///   index, failed transactions ignored; finalized commitment counts as 32.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain(&self) -> Chain;

    async fn tip_height(&self) -> Result<u64, CoreError>;

    /// `blocks` is Some only for chains where `uses_block_cursor()` holds.
    async fn incoming_transfers(
        &self,
        targets: &[ScanTarget],
        blocks: Option<BlockRange>,
    ) -> Result<Vec<IncomingTransfer>, CoreError>;

    async fn tx_confirmations(&self, tx_hash: &str) -> Result<i32, CoreError>;

    /// Sign with the decrypted key and submit. Returns the transaction hash.
    /// Must distinguish `CoreError::Signing` (terminal for the withdrawal)
    /// from `CoreError::ChainRpc` (also refunded; the claim already consumed
    /// the row).
    async fn broadcast(
        &self,
        request: &BroadcastRequest,
        signing_key: &[u8],
    ) -> Result<String, CoreError>;
}

/// HD wallet derivation capability used when the pool is empty.
pub trait WalletDeriver: Send + Sync {
    fn derive(&self, chain: Chain, index: i32) -> Result<DerivedWallet, CoreError>;
}

#[derive(Debug, Clone)]
pub struct DerivedWallet {
    pub address: String,
    pub derivation_path: String,
    pub destination_tag: Option<String>,
    pub private_key: Vec<u8>,
}

/// Configured chain clients, keyed by chain. Chains without a client are
/// skipped by the workers.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    clients: HashMap<Chain, Arc<dyn ChainClient>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ChainClient>) {
        self.clients.insert(client.chain(), client);
    }

    pub fn get(&self, chain: Chain) -> Option<&Arc<dyn ChainClient>> {
        self.clients.get(&chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_settles_on_ethereum() {
        assert_eq!(Asset::Link.chain(), Chain::Ethereum);
        assert!(Chain::Ethereum.assets().contains(&Asset::Link));
    }

    #[test]
    fn confirmation_thresholds() {
        assert_eq!(Asset::Btc.required_confirmations(), 2);
        assert_eq!(Asset::Eth.required_confirmations(), 12);
        assert_eq!(Asset::Ltc.required_confirmations(), 6);
        assert_eq!(Asset::Xrp.required_confirmations(), 1);
        assert_eq!(Asset::Sol.required_confirmations(), 32);
        assert_eq!(Asset::Link.required_confirmations(), 12);
    }

    #[test]
    fn asset_round_trips_through_text() {
        for asset in Asset::ALL {
            assert_eq!(asset.as_str().parse::<Asset>().unwrap(), asset);
        }
    }
}
