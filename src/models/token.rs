use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// A supported token with the decimals used to normalise its base units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub address: Address,
    pub decimals: u8,
}

impl Token {
    pub fn is_eth(&self) -> bool {
        self.id == "ETH"
    }
}

/// Lookup table over the configured token list.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: Vec<Token>,
}

impl TokenTable {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn all(&self) -> &[Token] {
        &self.tokens
    }

    pub fn by_address(&self, address: &Address) -> Option<&Token> {
        self.tokens.iter().find(|t| t.address == *address)
    }

    pub fn eth(&self) -> Option<&Token> {
        self.tokens.iter().find(|t| t.is_eth())
    }

    /// Tokens quoted against ETH, i.e. everything except the ETH leg itself.
    pub fn non_eth(&self) -> Vec<Token> {
        self.tokens.iter().filter(|t| !t.is_eth()).cloned().collect()
    }
}
