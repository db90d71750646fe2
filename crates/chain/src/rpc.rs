use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::Block;
use crate::chain::Chain;
use crate::error::ChainError;
use crate::tx::Transaction;
use crate::types::{Address, Hash};

// ════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════
// Codes follow JSON-RPC: -326xx for malformed requests, -320xx for
// application errors.
// ════════════════════════════════════════════════════════════════════════════

pub const INVALID_PARAMS: i32 = -32602;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const NOT_FOUND: i32 = -32001;
pub const REJECTED: i32 = -32002;
pub const INTERNAL: i32 = -32000;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self { code: INVALID_PARAMS, message: message.into() }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl From<ChainError> for RpcError {
    fn from(e: ChainError) -> Self {
        let code = if e.is_not_found() {
            NOT_FOUND
        } else if matches!(e, ChainError::Storage(_) | ChainError::Encoding(_) | ChainError::Json(_)) {
            INTERNAL
        } else {
            REJECTED
        };
        Self { code, message: e.to_string() }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

// ════════════════════════════════════════════════════════════════════════════
// RESPONSE TYPES
// ════════════════════════════════════════════════════════════════════════════
// Amounts are decimal strings in the smallest unit; u128 does not survive
// JSON number handling in most clients.
// ════════════════════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BalanceRes {
    pub address: String,
    pub balance: String,
    pub staked: String,
    pub locked: String,
    pub nonce: u64,
}

/// Block header fields plus the hashes of its transactions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: String,
    pub producer: String,
    pub state_root: String,
    pub tx_root: String,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub transactions: Vec<String>,
}

impl From<&Block> for BlockSummary {
    fn from(block: &Block) -> Self {
        Self {
            height: block.height(),
            hash: block.hash.to_hex(),
            previous_hash: block.header.previous_hash.to_hex(),
            timestamp: block.header.timestamp.to_rfc3339(),
            producer: block.header.producer.to_string(),
            state_root: block.header.state_root.to_hex(),
            tx_root: block.header.tx_root.to_hex(),
            gas_used: block.header.gas_used,
            gas_limit: block.header.gas_limit,
            transactions: block.tx_hashes().iter().map(|h| h.to_hex()).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ValidatorRes {
    pub address: String,
    pub voting_power: String,
    pub self_stake: String,
    pub commission: u16,
    pub status: String,
    pub jailed: bool,
    pub moniker: String,
}

/// Request to submit a transaction: hex of its bincode encoding.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SubmitTxReq {
    pub tx_hex: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SubmitTxRes {
    /// accepted into the mempool; inclusion is not guaranteed
    pub success: bool,
    /// empty when rejected
    pub txid: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StakingInfoRes {
    pub delegator: String,
    pub validator: String,
    pub staked: String,
    pub rewards: String,
    pub unbonding_count: usize,
    pub unbonding_amount: String,
    pub created_at_height: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLER
// ════════════════════════════════════════════════════════════════════════════

fn parse_address(raw: &str) -> RpcResult<Address> {
    raw.parse::<Address>()
        .map_err(|e| RpcError::invalid_params(format!("invalid address format: {}", e)))
}

fn parse_hash(raw: &str) -> RpcResult<Hash> {
    raw.parse::<Hash>()
        .map_err(|e| RpcError::invalid_params(format!("invalid hash format: {}", e)))
}

/// Read-mostly query surface over a shared [`Chain`]. No ledger logic lives
/// here; every method delegates.
#[derive(Clone, Debug)]
pub struct RpcHandler {
    chain: Arc<Chain>,
}

impl RpcHandler {
    pub fn new(chain: Arc<Chain>) -> Self {
        Self { chain }
    }

    pub fn block_number(&self) -> u64 {
        self.chain.get_height()
    }

    /// Unknown addresses are an error, not a zero balance.
    pub fn get_balance(&self, address: &str) -> RpcResult<BalanceRes> {
        let addr = parse_address(address)?;
        let account = self.chain.get_account(&addr)?;
        Ok(BalanceRes {
            address: addr.to_string(),
            balance: account.balance.to_string(),
            staked: account.staked.to_string(),
            locked: account.locked.to_string(),
            nonce: account.nonce,
        })
    }

    pub fn get_block_by_number(&self, number: u64) -> RpcResult<BlockSummary> {
        let block = self.chain.get_block_by_number(number)?;
        Ok(BlockSummary::from(&block))
    }

    pub fn get_block_by_hash(&self, hash: &str) -> RpcResult<BlockSummary> {
        let block = self.chain.get_block_by_hash(&parse_hash(hash)?)?;
        Ok(BlockSummary::from(&block))
    }

    pub fn get_validators(&self) -> Vec<ValidatorRes> {
        self.chain
            .dpos
            .get_validators()
            .into_iter()
            .map(|v| ValidatorRes {
                address: v.address.to_string(),
                voting_power: v.voting_power.to_string(),
                self_stake: v.self_stake.to_string(),
                commission: v.commission,
                status: v.status.as_str().to_string(),
                jailed: v.jailed,
                moniker: v.moniker,
            })
            .collect()
    }

    /// Malformed payloads are request errors; a transaction the chain
    /// refuses is reported with `success = false`.
    pub fn send_transaction(&self, req: SubmitTxReq) -> RpcResult<SubmitTxRes> {
        let raw = hex::decode(req.tx_hex.trim_start_matches("0x"))
            .map_err(|e| RpcError::invalid_params(format!("invalid transaction encoding: {}", e)))?;
        let tx: Transaction = bincode::deserialize(&raw)
            .map_err(|e| RpcError::invalid_params(format!("invalid transaction format: {}", e)))?;

        match self.chain.submit_transaction(tx) {
            Ok(hash) => Ok(SubmitTxRes {
                success: true,
                txid: hash.to_hex(),
                message: "transaction accepted".to_string(),
            }),
            Err(e) if matches!(e, ChainError::Storage(_)) => Err(e.into()),
            Err(e) => Ok(SubmitTxRes { success: false, txid: String::new(), message: e.to_string() }),
        }
    }

    pub fn get_staking_info(&self, delegator: &str, validator: &str) -> RpcResult<StakingInfoRes> {
        let info = self
            .chain
            .staking
            .get_staking_info(&parse_address(delegator)?, &parse_address(validator)?)?;
        Ok(StakingInfoRes {
            delegator: info.delegator.to_string(),
            validator: info.validator.to_string(),
            staked: info.staked_amount.to_string(),
            rewards: info.rewards.to_string(),
            unbonding_count: info.unbonding_count,
            unbonding_amount: info.unbonding_amount.to_string(),
            created_at_height: info.created_at_height,
        })
    }

    /// JSON dispatcher. `params` is an object with the method's named
    /// arguments.
    pub fn handle(&self, method: &str, params: &Value) -> RpcResult<Value> {
        let out = match method {
            "block_number" => to_value(self.block_number())?,
            "get_balance" => to_value(self.get_balance(str_param(params, "address")?)?)?,
            "get_block_by_number" => to_value(self.get_block_by_number(u64_param(params, "number")?)?)?,
            "get_block_by_hash" => to_value(self.get_block_by_hash(str_param(params, "hash")?)?)?,
            "get_validators" => to_value(self.get_validators())?,
            "send_transaction" => {
                let req = SubmitTxReq { tx_hex: str_param(params, "tx_hex")?.to_string() };
                to_value(self.send_transaction(req)?)?
            }
            "get_staking_info" => to_value(
                self.get_staking_info(str_param(params, "delegator")?, str_param(params, "validator")?)?,
            )?,
            other => {
                return Err(RpcError { code: METHOD_NOT_FOUND, message: format!("unknown method: {}", other) });
            }
        };
        Ok(out)
    }
}

fn to_value<T: Serialize>(v: T) -> RpcResult<Value> {
    serde_json::to_value(v).map_err(|e| RpcError { code: INTERNAL, message: e.to_string() })
}

fn str_param<'a>(params: &'a Value, name: &str) -> RpcResult<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing string param `{}`", name)))
}

fn u64_param(params: &Value, name: &str) -> RpcResult<u64> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| RpcError::invalid_params(format!("missing integer param `{}`", name)))
}
