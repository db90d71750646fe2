//! Transactions
//!
//! A transaction carries a type tag and an opaque `data` payload whose
//! layout depends on the type (`StakeData`, `CreateValidatorData`,
//! `EditValidatorData`, bincode-encoded). The hash covers every field but
//! `hash` and `signature`; `sign` sets public key, hash and signature
//! together and the signature is made over the hash bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{address_from_pubkey_bytes, sha3_512, verify_signature, KeyPair};
use crate::error::{ChainError, Result};
use crate::types::{Address, Amount, Hash, DEFAULT_GAS_LIMIT, DEFAULT_GAS_PRICE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxType {
    Transfer = 0,
    Stake = 1,
    Unstake = 2,
    Delegate = 3,
    Undelegate = 4,
    Vote = 5,
    CreateValidator = 6,
    EditValidator = 7,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Transfer => "transfer",
            TxType::Stake => "stake",
            TxType::Unstake => "unstake",
            TxType::Delegate => "delegate",
            TxType::Undelegate => "undelegate",
            TxType::Vote => "vote",
            TxType::CreateValidator => "create_validator",
            TxType::EditValidator => "edit_validator",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for TxType {
    type Error = ChainError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => TxType::Transfer,
            1 => TxType::Stake,
            2 => TxType::Unstake,
            3 => TxType::Delegate,
            4 => TxType::Undelegate,
            5 => TxType::Vote,
            6 => TxType::CreateValidator,
            7 => TxType::EditValidator,
            other => return Err(ChainError::InvalidTransaction(format!("unknown tx type {}", other))),
        })
    }
}

/// Payload of stake, unstake, delegate and undelegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeData {
    pub validator: Address,
    pub amount: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateValidatorData {
    /// basis points
    pub commission: u16,
    pub self_stake: Amount,
    pub moniker: String,
    pub website: String,
    pub details: String,
}

/// Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditValidatorData {
    pub commission: Option<u16>,
    pub moniker: Option<String>,
    pub website: Option<String>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub tx_type: TxType,
    pub from: Address,
    pub to: Address,
    pub value: Amount,
    pub data: Vec<u8>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Amount,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn new(tx_type: TxType, from: Address, to: Address, value: Amount, data: Vec<u8>, nonce: u64) -> Self {
        Self {
            hash: Hash::zero(),
            tx_type,
            from,
            to,
            value,
            data,
            nonce,
            gas_limit: DEFAULT_GAS_LIMIT,
            gas_price: DEFAULT_GAS_PRICE,
            public_key: Vec::new(),
            signature: Vec::new(),
        }
    }

    pub fn with_gas(mut self, gas_limit: u64, gas_price: Amount) -> Self {
        self.gas_limit = gas_limit;
        self.gas_price = gas_price;
        self
    }

    pub fn transfer(from: Address, to: Address, value: Amount, nonce: u64) -> Self {
        Self::new(TxType::Transfer, from, to, value, Vec::new(), nonce)
    }

    fn staking(tx_type: TxType, from: Address, validator: Address, amount: Amount, nonce: u64) -> Result<Self> {
        let data = bincode::serialize(&StakeData { validator, amount })?;
        Ok(Self::new(tx_type, from, validator, 0, data, nonce))
    }

    /// balance -> staked on the sender's own account
    pub fn stake(from: Address, amount: Amount, nonce: u64) -> Result<Self> {
        Self::staking(TxType::Stake, from, from, amount, nonce)
    }

    /// staked -> locked on the sender's own account
    pub fn unstake(from: Address, amount: Amount, nonce: u64) -> Result<Self> {
        Self::staking(TxType::Unstake, from, from, amount, nonce)
    }

    pub fn delegate(from: Address, validator: Address, amount: Amount, nonce: u64) -> Result<Self> {
        Self::staking(TxType::Delegate, from, validator, amount, nonce)
    }

    pub fn undelegate(from: Address, validator: Address, amount: Amount, nonce: u64) -> Result<Self> {
        Self::staking(TxType::Undelegate, from, validator, amount, nonce)
    }

    pub fn create_validator(from: Address, data: &CreateValidatorData, nonce: u64) -> Result<Self> {
        Ok(Self::new(TxType::CreateValidator, from, from, 0, bincode::serialize(data)?, nonce))
    }

    pub fn edit_validator(from: Address, data: &EditValidatorData, nonce: u64) -> Result<Self> {
        Ok(Self::new(TxType::EditValidator, from, from, 0, bincode::serialize(data)?, nonce))
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.data)
            .map_err(|e| ChainError::InvalidTransaction(format!("malformed {} payload: {}", self.tx_type, e)))
    }

    /// Canonical bytes covered by the hash.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(
            &self.tx_type,
            &self.from,
            &self.to,
            &self.value,
            &self.data,
            &self.nonce,
            &self.gas_limit,
            &self.gas_price,
            &self.public_key,
        ))?)
    }

    pub fn compute_hash(&self) -> Result<Hash> {
        Ok(sha3_512(&self.signing_bytes()?))
    }

    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        self.public_key = keypair.public_key().to_vec();
        self.hash = self.compute_hash()?;
        self.signature = keypair.sign(self.hash.as_bytes())?;
        Ok(())
    }

    /// Consuming variant of [`Transaction::sign`].
    pub fn signed(mut self, keypair: &KeyPair) -> Result<Self> {
        self.sign(keypair)?;
        Ok(self)
    }

    /// gas_limit * gas_price
    pub fn fee(&self) -> Result<Amount> {
        (self.gas_limit as u128).checked_mul(self.gas_price).ok_or(ChainError::Overflow)
    }

    /// value + gas_limit * gas_price
    pub fn cost(&self) -> Result<Amount> {
        self.value.checked_add(self.fee()?).ok_or(ChainError::Overflow)
    }

    /// Stateless checks: gas fields, hash and signature over the hash.
    pub fn validate(&self) -> Result<()> {
        if self.gas_limit == 0 {
            return Err(ChainError::InvalidTransaction("gas limit must be positive".into()));
        }
        if self.gas_price == 0 {
            return Err(ChainError::InvalidTransaction("gas price must be positive".into()));
        }
        if self.signature.is_empty() || self.public_key.is_empty() {
            return Err(ChainError::InvalidTransaction("missing public key or signature".into()));
        }
        if address_from_pubkey_bytes(&self.public_key) != self.from {
            return Err(ChainError::InvalidTransaction("public key does not match sender".into()));
        }
        if self.compute_hash()? != self.hash {
            return Err(ChainError::InvalidTransaction("hash mismatch".into()));
        }
        let valid = verify_signature(&self.public_key, self.hash.as_bytes(), &self.signature)
            .map_err(|e| ChainError::InvalidTransaction(format!("bad signature: {}", e)))?;
        if !valid {
            return Err(ChainError::InvalidTransaction("invalid signature".into()));
        }
        Ok(())
    }
}
