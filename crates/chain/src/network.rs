//! Peer message envelopes and their routing onto the chain.
//!
//! Transport is out of scope: a node hands decoded [`Message`]s to
//! [`ProtocolHandler::handle`] and sends back whatever replies it returns.
//! Outbound gossip goes through the [`Broadcaster`] seam.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockHeader};
use crate::chain::Chain;
use crate::error::Result;
use crate::state::Account;
use crate::tx::Transaction;
use crate::types::Address;

pub const BLOCKS_TOPIC: &str = "blocks";
pub const TRANSACTIONS_TOPIC: &str = "transactions";

/// Range replies cover at most `start..=start + MAX_BLOCKS_PER_REQUEST`.
pub const MAX_BLOCKS_PER_REQUEST: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Block,
    Transaction,
    GetBlocks,
    GetBlockHeaders,
    BlockHeaders,
    GetState,
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub data: Value,
}

impl Message {
    pub fn new<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self> {
        Ok(Self { msg_type, data: serde_json::to_value(payload)? })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PAYLOADS
// ════════════════════════════════════════════════════════════════════════════

/// Inclusive height range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    /// `start..=min(end, start + MAX_BLOCKS_PER_REQUEST)`
    pub fn capped_end(&self) -> u64 {
        self.end.min(self.start.saturating_add(MAX_BLOCKS_PER_REQUEST))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaders {
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetState {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReply {
    pub address: Address,
    pub height: u64,
    /// `None` for an address the ledger has never seen
    pub account: Option<Account>,
}

// ════════════════════════════════════════════════════════════════════════════
// ROUTING
// ════════════════════════════════════════════════════════════════════════════

/// Publishes an encoded message to every peer subscribed to `topic`.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()>;
}

pub struct ProtocolHandler {
    chain: Arc<Chain>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler").field("chain", &self.chain).finish()
    }
}

impl ProtocolHandler {
    pub fn new(chain: Arc<Chain>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { chain, broadcaster }
    }

    /// Route one inbound message. Returns the replies for the sender.
    pub fn handle(&self, msg: &Message) -> Result<Vec<Message>> {
        match msg.msg_type {
            MessageType::Block => {
                let block: Block = msg.decode()?;
                let height = block.height();
                self.chain.add_block(block.clone())?;
                info!(height, hash = %block.hash, "peer block accepted");
                self.broadcast_block(&block)?;
                Ok(Vec::new())
            }
            MessageType::Transaction => {
                let tx: Transaction = msg.decode()?;
                let hash = self.chain.submit_transaction(tx)?;
                debug!(tx = %hash, "peer transaction queued");
                Ok(Vec::new())
            }
            MessageType::GetBlocks => {
                let range: BlockRange = msg.decode()?;
                let blocks = self.blocks_in(range)?;
                debug!(start = range.start, end = range.end, served = blocks.len(), "get blocks");
                blocks.iter().map(|b| Message::new(MessageType::Block, b)).collect()
            }
            MessageType::GetBlockHeaders => {
                let range: BlockRange = msg.decode()?;
                let headers = self.blocks_in(range)?.into_iter().map(|b| b.header).collect();
                Ok(vec![Message::new(MessageType::BlockHeaders, &BlockHeaders { headers })?])
            }
            MessageType::GetState => {
                let req: GetState = msg.decode()?;
                let reply = StateReply {
                    address: req.address,
                    height: self.chain.get_height(),
                    account: self.chain.state.find_account(&req.address)?,
                };
                Ok(vec![Message::new(MessageType::State, &reply)?])
            }
            MessageType::BlockHeaders | MessageType::State => {
                debug!(kind = ?msg.msg_type, "unsolicited reply ignored");
                Ok(Vec::new())
            }
        }
    }

    fn blocks_in(&self, range: BlockRange) -> Result<Vec<Block>> {
        if range.start > range.end {
            return Ok(Vec::new());
        }
        self.chain.get_blocks_range(range.start, range.capped_end())
    }

    /// Publishing failures are logged; the block is already committed.
    pub fn broadcast_block(&self, block: &Block) -> Result<()> {
        self.publish(BLOCKS_TOPIC, &Message::new(MessageType::Block, block)?)
    }

    pub fn broadcast_transaction(&self, tx: &Transaction) -> Result<()> {
        self.publish(TRANSACTIONS_TOPIC, &Message::new(MessageType::Transaction, tx)?)
    }

    fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        let bytes = msg.to_bytes()?;
        if let Err(e) = self.broadcaster.broadcast(topic, &bytes) {
            warn!(topic, error = %e, "broadcast failed");
        }
        Ok(())
    }
}
