//! Test doubles for the escrow contract.
//!
//! Public so integration tests and downstream crates can drive the lifecycle
//! without a chain.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::EscrowResult;
use crate::error::EscrowError;
use crate::escrow_bridge::{
    ContractCall, ContractResult, ContractResultSource, ContractSubmitter, EvmAddress,
};

/// Entity id a [`ScriptedContract`] answers as unless told otherwise
pub const SCRIPTED_CONTRACT_ID: &str = "0.0.7007";

/// One scripted answer to a result poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Not yet observable
    Pending,
    /// Executed successfully with this return data
    Success(Vec<u8>),
    /// Executed and reverted with this reason
    Reverted(String),
    /// The result source itself failed transiently
    Unavailable(String),
}

#[derive(Default)]
struct Script {
    steps: VecDeque<ScriptStep>,
    function_parameters: Vec<u8>,
    amount: u64,
}

/// In-memory contract that answers polls from per-transaction scripts.
///
/// Steps are consumed in order; the last step repeats. Unscripted
/// transactions stay pending forever. Calls sent through
/// [`ContractSubmitter::submit`] are scripted automatically: project
/// creations return sequential project ids, everything else succeeds
/// with empty return data.
pub struct ScriptedContract {
    address: EvmAddress,
    scripts: RwLock<HashMap<String, Script>>,
    fetches: RwLock<HashMap<String, u32>>,
    submitted: RwLock<Vec<ContractCall>>,
    pending_polls: AtomicU64,
    next_tx: AtomicU64,
    next_project_id: AtomicU64,
}

impl Default for ScriptedContract {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedContract {
    pub fn new() -> Self {
        Self {
            address: EvmAddress::long_zero(0, 0, 7007),
            scripts: RwLock::default(),
            fetches: RwLock::default(),
            submitted: RwLock::default(),
            pending_polls: AtomicU64::new(0),
            next_tx: AtomicU64::new(0),
            next_project_id: AtomicU64::new(0),
        }
    }

    /// Report executions against `address` instead of [`SCRIPTED_CONTRACT_ID`].
    pub fn with_address(mut self, address: EvmAddress) -> Self {
        self.address = address;
        self
    }

    /// Make automatically scripted transactions report pending `polls` times
    /// before succeeding.
    pub fn with_pending_polls(self, polls: u64) -> Self {
        self.pending_polls.store(polls, Ordering::SeqCst);
        self
    }

    /// Replace the script for `tx_ref`. The transaction carries no calldata.
    pub async fn script(&self, tx_ref: &str, steps: Vec<ScriptStep>) {
        let script = Script {
            steps: steps.into(),
            ..Default::default()
        };
        self.scripts.write().await.insert(tx_ref.to_string(), script);
    }

    /// Replace the script for `tx_ref`, which executes `call`.
    pub async fn script_call(
        &self,
        tx_ref: &str,
        call: &ContractCall,
        steps: Vec<ScriptStep>,
    ) -> EscrowResult<()> {
        let script = Script {
            steps: steps.into(),
            function_parameters: call.encode()?,
            amount: call.value_tinybars()?,
        };
        self.scripts.write().await.insert(tx_ref.to_string(), script);
        Ok(())
    }

    /// Script a successful project creation returning `project_id`.
    pub async fn script_project_created(
        &self,
        tx_ref: &str,
        call: &ContractCall,
        project_id: u64,
    ) -> EscrowResult<()> {
        self.script_call(tx_ref, call, vec![ScriptStep::Success(encode_word(project_id))])
            .await
    }

    /// How often `tx_ref` was polled.
    pub async fn fetch_count(&self, tx_ref: &str) -> u32 {
        self.fetches.read().await.get(tx_ref).copied().unwrap_or(0)
    }

    /// Calls received through `submit`, oldest first.
    pub async fn submitted(&self) -> Vec<ContractCall> {
        self.submitted.read().await.clone()
    }
}

#[async_trait]
impl ContractSubmitter for ScriptedContract {
    async fn submit(&self, call: ContractCall) -> EscrowResult<String> {
        let tx_ref = format!("0.0.5005@{}", self.next_tx.fetch_add(1, Ordering::SeqCst) + 1);

        let return_data = match &call {
            ContractCall::CreateProject { .. } => {
                encode_word(self.next_project_id.fetch_add(1, Ordering::SeqCst) + 1)
            }
            _ => Vec::new(),
        };
        let mut steps = vec![ScriptStep::Pending; self.pending_polls.load(Ordering::SeqCst) as usize];
        steps.push(ScriptStep::Success(return_data));

        self.script_call(&tx_ref, &call, steps).await?;
        self.submitted.write().await.push(call);
        Ok(tx_ref)
    }
}

#[async_trait]
impl ContractResultSource for ScriptedContract {
    async fn fetch_result(&self, tx_ref: &str) -> EscrowResult<Option<ContractResult>> {
        *self.fetches.write().await.entry(tx_ref.to_string()).or_insert(0) += 1;

        let (step, function_parameters, amount) = {
            let mut scripts = self.scripts.write().await;
            match scripts.get_mut(tx_ref) {
                Some(script) => {
                    let step = if script.steps.len() > 1 {
                        script.steps.pop_front()
                    } else {
                        script.steps.front().cloned()
                    };
                    (step, script.function_parameters.clone(), script.amount)
                }
                None => (None, Vec::new(), 0),
            }
        };

        let result = |succeeded: bool, error_message: Option<String>, call_result: Vec<u8>| {
            ContractResult {
                tx_ref: tx_ref.to_string(),
                succeeded,
                error_message,
                contract: Some(self.address),
                function_parameters: function_parameters.clone(),
                amount,
                call_result,
            }
        };

        match step {
            None | Some(ScriptStep::Pending) => Ok(None),
            Some(ScriptStep::Success(data)) => Ok(Some(result(true, None, data))),
            Some(ScriptStep::Reverted(reason)) => Ok(Some(result(false, Some(reason), Vec::new()))),
            Some(ScriptStep::Unavailable(reason)) => Err(EscrowError::integration(reason)),
        }
    }
}

/// ABI-encode `value` as one 32-byte word.
pub fn encode_word(value: u64) -> Vec<u8> {
    let mut word = vec![0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}
