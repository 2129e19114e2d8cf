//! Escrow Confirmation Bridge - Reconciles jobs with the on-chain contract
//!
//! Funds never touch this service: the escrow contract holds them, and the
//! client wallet signs most calls. The bridge only observes. Given a
//! submitted transaction it polls a result source until the execution is
//! visible, rejects reverted calls, and checks that the transaction executed
//! exactly the call the job expects (target contract, calldata and attached
//! value) before anything is mirrored locally.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{ChainOutcome, WalletAddress};
use crate::{EscrowResult, error::EscrowError};

/// Smallest HBAR unit
const TINYBARS_PER_HBAR: i64 = 100_000_000;

// keccak256 selectors of the escrow contract functions
const CREATE_PROJECT_SELECTOR: [u8; 4] = [0x3c, 0x72, 0x0b, 0xd6]; // createProjectHBAR(address,uint256,uint256)
const REQUEST_REFUND_SELECTOR: [u8; 4] = [0xa4, 0xb2, 0x40, 0x9e]; // requestRefund(uint256)
const AUTO_REFUND_SELECTOR: [u8; 4] = [0xef, 0x4c, 0x64, 0xbf]; // autoRefundIfLate(uint256)
const AUTO_APPROVE_SELECTOR: [u8; 4] = [0x33, 0xcb, 0x89, 0xe3]; // autoApproveIfClientSilent(uint256)

/// Configuration for confirmation polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Polls before giving up
    pub max_attempts: u32,
    /// Delay between polls in milliseconds
    pub poll_interval_ms: u64,
    /// Mirror node REST base URL
    pub mirror_node_url: String,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,
    /// Escrow contract, as `shard.realm.num` or `0x` EVM address
    pub contract_address: String,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            poll_interval_ms: 2000,
            mirror_node_url: "https://testnet.mirrornode.hedera.com".to_string(),
            request_timeout_secs: 10,
            contract_address: String::new(),
        }
    }
}

/// 20-byte address as seen by the EVM
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvmAddress([u8; 20]);

impl EvmAddress {
    /// Parse a `0x`-prefixed hex address or a `shard.realm.num` entity id.
    pub fn parse(raw: &str) -> EscrowResult<Self> {
        let raw = raw.trim();
        if let Some(hex_part) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            let bytes = hex::decode(hex_part)
                .map_err(|e| EscrowError::validation(format!("Malformed EVM address: {e}")))?;
            let bytes: [u8; 20] = bytes
                .try_into()
                .map_err(|_| EscrowError::validation("EVM address must be 20 bytes"))?;
            return Ok(Self(bytes));
        }

        let mut parts = raw.split('.');
        let (Some(shard), Some(realm), Some(num), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(EscrowError::validation(
                "Address must be 0x-prefixed hex or shard.realm.num",
            ));
        };
        let invalid = |_| EscrowError::validation("Entity id components must be integers");
        Ok(Self::long_zero(
            shard.parse().map_err(invalid)?,
            realm.parse().map_err(invalid)?,
            num.parse().map_err(invalid)?,
        ))
    }

    /// Long-zero address of a `shard.realm.num` entity
    pub fn long_zero(shard: u32, realm: u64, num: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&shard.to_be_bytes());
        bytes[4..12].copy_from_slice(&realm.to_be_bytes());
        bytes[12..].copy_from_slice(&num.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvmAddress(0x{})", hex::encode(self.0))
    }
}

/// Convert an HBAR amount to tinybars. Fails on sub-tinybar precision.
pub fn price_in_tinybars(price: Decimal) -> EscrowResult<u64> {
    let scaled = price
        .checked_mul(Decimal::from(TINYBARS_PER_HBAR))
        .ok_or_else(|| EscrowError::validation("Price is out of range"))?;
    if !scaled.fract().is_zero() {
        return Err(EscrowError::validation(
            "Price cannot be finer than one tinybar (8 decimal places)",
        ));
    }
    scaled
        .to_u64()
        .ok_or_else(|| EscrowError::validation("Price must be a non-negative tinybar amount"))
}

/// Calls the escrow contract accepts that this service submits or mirrors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    /// Client locks `price` for a new project
    CreateProject {
        freelancer: WalletAddress,
        price: Decimal,
        delivery_deadline: DateTime<Utc>,
        approval_deadline: DateTime<Utc>,
    },
    /// Client takes the funds back before delivery
    RequestRefund { project_id: u64 },
    /// Anyone may call once the delivery deadline has passed
    AutoRefundIfLate { project_id: u64 },
    /// Anyone may call once the approval deadline has passed
    AutoApproveIfClientSilent { project_id: u64 },
}

impl ContractCall {
    pub fn function_name(&self) -> &'static str {
        match self {
            Self::CreateProject { .. } => "createProjectHBAR",
            Self::RequestRefund { .. } => "requestRefund",
            Self::AutoRefundIfLate { .. } => "autoRefundIfLate",
            Self::AutoApproveIfClientSilent { .. } => "autoApproveIfClientSilent",
        }
    }

    /// Call that forces `outcome` for `project_id` once its deadline lapsed.
    pub fn resolving(outcome: ChainOutcome, project_id: u64) -> Self {
        match outcome {
            ChainOutcome::Refunded => Self::AutoRefundIfLate { project_id },
            ChainOutcome::AutoApproved => Self::AutoApproveIfClientSilent { project_id },
        }
    }

    /// ABI-encoded calldata: selector followed by 32-byte argument words.
    ///
    /// Deadlines are encoded at whole-second precision, the approval deadline
    /// as a window after the delivery deadline.
    pub fn encode(&self) -> EscrowResult<Vec<u8>> {
        match self {
            Self::CreateProject {
                freelancer,
                delivery_deadline,
                approval_deadline,
                ..
            } => {
                let freelancer = EvmAddress::parse(freelancer.as_str())?;
                let deadline = u64::try_from(delivery_deadline.timestamp())
                    .map_err(|_| EscrowError::validation("Delivery deadline precedes the epoch"))?;
                let window = u64::try_from(
                    approval_deadline.timestamp() - delivery_deadline.timestamp(),
                )
                .map_err(|_| {
                    EscrowError::validation("Approval deadline precedes the delivery deadline")
                })?;

                let mut data = CREATE_PROJECT_SELECTOR.to_vec();
                let mut address_word = [0u8; 32];
                address_word[12..].copy_from_slice(freelancer.as_bytes());
                data.extend_from_slice(&address_word);
                data.extend_from_slice(&uint_word(window));
                data.extend_from_slice(&uint_word(deadline));
                Ok(data)
            }
            Self::RequestRefund { project_id } => Ok(single_arg(REQUEST_REFUND_SELECTOR, *project_id)),
            Self::AutoRefundIfLate { project_id } => Ok(single_arg(AUTO_REFUND_SELECTOR, *project_id)),
            Self::AutoApproveIfClientSilent { project_id } => {
                Ok(single_arg(AUTO_APPROVE_SELECTOR, *project_id))
            }
        }
    }

    /// Value in tinybars the call must carry
    pub fn value_tinybars(&self) -> EscrowResult<u64> {
        match self {
            Self::CreateProject { price, .. } => price_in_tinybars(*price),
            _ => Ok(0),
        }
    }

    /// Whether `result` executed exactly this call
    pub fn matches(&self, result: &ContractResult) -> EscrowResult<bool> {
        Ok(result.function_parameters == self.encode()? && result.amount == self.value_tinybars()?)
    }
}

fn uint_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn single_arg(selector: [u8; 4], value: u64) -> Vec<u8> {
    let mut data = selector.to_vec();
    data.extend_from_slice(&uint_word(value));
    data
}

/// Observed execution of one contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractResult {
    pub tx_ref: String,
    pub succeeded: bool,
    pub error_message: Option<String>,
    /// Contract the transaction executed
    pub contract: Option<EvmAddress>,
    /// Calldata the transaction carried
    pub function_parameters: Vec<u8>,
    /// Value attached, in tinybars
    pub amount: u64,
    /// ABI-encoded return data
    pub call_result: Vec<u8>,
}

impl ContractResult {
    /// First 32-byte return word as an integer, if it fits in 64 bits.
    pub fn first_word_u64(&self) -> Option<u64> {
        let word = self.call_result.get(..32)?;
        if word[..24].iter().any(|b| *b != 0) {
            return None;
        }
        let mut low = [0u8; 8];
        low.copy_from_slice(&word[24..]);
        Some(u64::from_be_bytes(low))
    }
}

/// Project creation as observed on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfirmation {
    pub project_id: u64,
    pub tx_ref: String,
}

/// Sends calls to the escrow contract. In production the client wallet
/// usually does this; server-side submitters handle deadline resolutions.
#[async_trait]
pub trait ContractSubmitter: Send + Sync {
    /// Submit `call` and return its transaction reference.
    async fn submit(&self, call: ContractCall) -> EscrowResult<String>;
}

/// Looks up executed contract calls.
#[async_trait]
pub trait ContractResultSource: Send + Sync {
    /// `Ok(None)` while the transaction is not yet observable.
    async fn fetch_result(&self, tx_ref: &str) -> EscrowResult<Option<ContractResult>>;
}

/// Bounded polling on top of a [`ContractResultSource`]
pub struct EscrowConfirmationBridge {
    config: ConfirmationConfig,
    contract: EvmAddress,
    source: Arc<dyn ContractResultSource>,
}

impl EscrowConfirmationBridge {
    pub fn new(config: ConfirmationConfig, source: Arc<dyn ContractResultSource>) -> EscrowResult<Self> {
        let contract = EvmAddress::parse(&config.contract_address).map_err(|e| {
            EscrowError::config(format!("confirmation.contract_address is invalid: {e}"))
        })?;
        Ok(Self {
            config,
            contract,
            source,
        })
    }

    /// Wait for `tx_ref` to execute `expected` (a project creation) and
    /// return the project id the contract assigned.
    pub async fn confirm_project_created(
        &self,
        tx_ref: &str,
        expected: &ContractCall,
    ) -> EscrowResult<ProjectConfirmation> {
        let result = self.await_result(tx_ref).await?;
        self.require_call(&result, std::slice::from_ref(expected))?;

        let project_id = result.first_word_u64().ok_or_else(|| {
            EscrowError::integration(format!(
                "transaction {tx_ref} returned no project id"
            ))
        })?;

        info!("Transaction {} created project {}", tx_ref, project_id);
        Ok(ProjectConfirmation {
            project_id,
            tx_ref: tx_ref.to_string(),
        })
    }

    /// Wait for `tx_ref` to succeed as one of the `accepted` calls.
    pub async fn confirm_outcome(
        &self,
        tx_ref: &str,
        accepted: &[ContractCall],
    ) -> EscrowResult<ContractResult> {
        let result = self.await_result(tx_ref).await?;
        let call = self.require_call(&result, accepted)?;
        info!("Transaction {} confirmed {}", tx_ref, call.function_name());
        Ok(result)
    }

    /// Submit `call` through `submitter` and wait for its execution.
    pub async fn submit_and_confirm(
        &self,
        submitter: &dyn ContractSubmitter,
        call: ContractCall,
    ) -> EscrowResult<ContractResult> {
        let function = call.function_name();
        let tx_ref = submitter.submit(call.clone()).await?;
        debug!("Submitted {} as {}", function, tx_ref);

        let result = self.await_result(&tx_ref).await?;
        self.require_call(&result, std::slice::from_ref(&call))?;
        Ok(result)
    }

    /// The accepted call `result` executed against the escrow contract.
    fn require_call<'a>(
        &self,
        result: &ContractResult,
        accepted: &'a [ContractCall],
    ) -> EscrowResult<&'a ContractCall> {
        if result.contract != Some(self.contract) {
            warn!("Transaction {} did not execute the escrow contract", result.tx_ref);
            return Err(EscrowError::precondition(format!(
                "Transaction {} did not execute the escrow contract",
                result.tx_ref
            )));
        }

        for call in accepted {
            if call.matches(result)? {
                return Ok(call);
            }
        }

        let expected: Vec<&str> = accepted.iter().map(ContractCall::function_name).collect();
        warn!(
            "Transaction {} does not match any of [{}]",
            result.tx_ref,
            expected.join(", ")
        );
        Err(EscrowError::precondition(format!(
            "Transaction {} is not the expected {} call for this job",
            result.tx_ref,
            expected.join("/")
        )))
    }

    async fn await_result(&self, tx_ref: &str) -> EscrowResult<ContractResult> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        for attempt in 1..=self.config.max_attempts {
            match self.source.fetch_result(tx_ref).await {
                Ok(Some(result)) if result.succeeded => return Ok(result),
                Ok(Some(result)) => {
                    let reason = result
                        .error_message
                        .unwrap_or_else(|| "no reason given".to_string());
                    warn!("Transaction {} reverted: {}", tx_ref, reason);
                    return Err(EscrowError::ContractReverted(format!("{tx_ref}: {reason}")));
                }
                Ok(None) => {
                    debug!("Transaction {} not visible yet (attempt {})", tx_ref, attempt);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Polling {} failed (attempt {}): {}", tx_ref, attempt, e);
                }
                Err(e) => return Err(e),
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(EscrowError::confirmation_timeout(tx_ref, self.config.max_attempts))
    }
}

/// Mirror node REST client
pub struct MirrorNodeClient {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct MirrorContractResult {
    result: Option<String>,
    error_message: Option<String>,
    call_result: Option<String>,
    to: Option<String>,
    function_parameters: Option<String>,
    amount: Option<u64>,
}

impl MirrorNodeClient {
    pub fn new(config: &ConfirmationConfig) -> EscrowResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(&config.mirror_node_url, client))
    }

    pub fn with_client(base_url: &str, client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn result_url(&self, tx_ref: &str) -> String {
        format!("{}/api/v1/contracts/results/{}", self.base_url, tx_ref)
    }
}

#[async_trait]
impl ContractResultSource for MirrorNodeClient {
    async fn fetch_result(&self, tx_ref: &str) -> EscrowResult<Option<ContractResult>> {
        let response = self
            .client
            .get(self.result_url(tx_ref))
            .send()
            .await
            .map_err(|e| EscrowError::integration(format!("mirror node request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EscrowError::integration(format!(
                "mirror node HTTP {status}: {body}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EscrowError::integration(format!("mirror node body unreadable: {e}")))?;
        parse_contract_result(tx_ref, &body).map(Some)
    }
}

/// Parse a mirror node `contracts/results/{tx}` response body.
pub fn parse_contract_result(tx_ref: &str, body: &str) -> EscrowResult<ContractResult> {
    let raw: MirrorContractResult = serde_json::from_str(body)?;
    let succeeded = raw.result.as_deref() == Some("SUCCESS");

    let call_result = decode_hex_field("call_result", raw.call_result.as_deref())?;
    let function_parameters =
        decode_hex_field("function_parameters", raw.function_parameters.as_deref())?;
    let contract = match raw.to.as_deref() {
        None | Some("") => None,
        Some(to) => Some(
            EvmAddress::parse(to)
                .map_err(|e| EscrowError::integration(format!("malformed contract address: {e}")))?,
        ),
    };

    let error_message = if succeeded {
        None
    } else {
        Some(
            raw.error_message
                .or(raw.result)
                .unwrap_or_else(|| "unknown failure".to_string()),
        )
    };

    Ok(ContractResult {
        tx_ref: tx_ref.to_string(),
        succeeded,
        error_message,
        contract,
        function_parameters,
        amount: raw.amount.unwrap_or(0),
        call_result,
    })
}

fn decode_hex_field(name: &str, value: Option<&str>) -> EscrowResult<Vec<u8>> {
    match value {
        None | Some("") | Some("0x") => Ok(Vec::new()),
        Some(encoded) => hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| EscrowError::integration(format!("malformed {name}: {e}"))),
    }
}
