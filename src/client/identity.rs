//! Wallet identity lookups.
//!
//! The dispatcher never owns wallets. It asks an [`IdentityProvider`] for the
//! address behind a wallet kind and prefers the session key unless the
//! request insists on the main wallet.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Wallet-type selector passed through to providers and submitters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    /// Whatever wallet the host considers active
    #[default]
    Default,
    /// Arweave-native wallet
    Arweave,
    /// EVM wallet bridged into AO
    Ethereum,
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WalletKind::Default => "default",
            WalletKind::Arweave => "arweave",
            WalletKind::Ethereum => "ethereum",
        };
        f.write_str(name)
    }
}

/// Addresses known for one connected wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    /// Main wallet address
    pub address: String,
    /// Session key address, when one has been issued
    pub session_key_address: Option<String>,
}

impl WalletInfo {
    /// Wallet without a session key.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            session_key_address: None,
        }
    }

    /// Attach a session key address.
    pub fn with_session_key(mut self, address: impl Into<String>) -> Self {
        self.session_key_address = Some(address.into());
        self
    }

    /// Address that signs on behalf of this wallet.
    pub fn effective_address(&self, use_main_wallet: bool) -> &str {
        match (&self.session_key_address, use_main_wallet) {
            (Some(session), false) if !session.is_empty() => session,
            _ => &self.address,
        }
    }
}

/// Source of wallet identities for the dispatcher.
pub trait IdentityProvider: Send + Sync {
    /// Return the wallet for `kind`, or `None` if nothing is connected.
    fn wallet(&self, kind: WalletKind) -> Option<WalletInfo>;
}

/// In-memory identity provider whose wallets can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    wallets: RwLock<HashMap<WalletKind, WalletInfo>>,
}

impl StaticIdentity {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with a single default wallet.
    pub fn with_default(info: WalletInfo) -> Self {
        let provider = Self::new();
        provider.set(WalletKind::Default, info);
        provider
    }

    /// Install or replace the wallet for `kind`.
    pub fn set(&self, kind: WalletKind, info: WalletInfo) {
        self.wallets.write().insert(kind, info);
    }

    /// Disconnect the wallet for `kind`.
    pub fn remove(&self, kind: WalletKind) -> Option<WalletInfo> {
        self.wallets.write().remove(&kind)
    }
}

impl IdentityProvider for StaticIdentity {
    fn wallet(&self, kind: WalletKind) -> Option<WalletInfo> {
        self.wallets.read().get(&kind).cloned()
    }
}
