//! Task records: the unit of work tracked from client request to ledger outcome.

use crate::error::ValidationError;
use crate::ledger::{TransactionFields, TxHandle};
use crate::status::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

/// Durable task key. `0` is reserved for the default-task query path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const DEFAULT_ALIAS: Sequence = Sequence(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Sequence(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    NewPayment,
    CancelPayment,
    ShopAction,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::NewPayment => "NewPayment",
            TaskKind::CancelPayment => "CancelPayment",
            TaskKind::ShopAction => "ShopAction",
        }
    }

    /// Whether the kind goes through a token approval step that can revert.
    pub fn has_approval_step(self) -> bool {
        !matches!(self, TaskKind::ShopAction)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NewPayment" => Ok(TaskKind::NewPayment),
            "CancelPayment" => Ok(TaskKind::CancelPayment),
            "ShopAction" => Ok(TaskKind::ShopAction),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShopOp {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub purchase_id: String,
    pub shop: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPayment {
    pub target: Sequence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopAction {
    pub shop: String,
    pub action: ShopOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Kind-specific data needed to (re)build the ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum TaskPayload {
    NewPayment(NewPayment),
    CancelPayment(CancelPayment),
    ShopAction(ShopAction),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::NewPayment(_) => TaskKind::NewPayment,
            TaskPayload::CancelPayment(_) => TaskKind::CancelPayment,
            TaskPayload::ShopAction(_) => TaskKind::ShopAction,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            TaskPayload::NewPayment(p) => {
                check_identifier("purchase_id", &p.purchase_id)?;
                check_identifier("shop", &p.shop)?;
                if p.amount < 0 {
                    return Err(ValidationError::NegativeAmount(p.amount));
                }
                if let Some(account) = &p.account {
                    check_address("account", account)?;
                }
                Ok(())
            }
            TaskPayload::CancelPayment(p) => {
                if p.target == Sequence::DEFAULT_ALIAS {
                    return Err(ValidationError::InvalidField {
                        field: "target",
                        reason: "sequence 0 is reserved".to_string(),
                    });
                }
                Ok(())
            }
            TaskPayload::ShopAction(p) => {
                check_identifier("shop", &p.shop)?;
                if let Some(provider) = &p.provider {
                    check_address("provider", provider)?;
                }
                Ok(())
            }
        }
    }

    /// Ledger call inputs derived from the payload.
    pub fn transaction_fields(&self) -> TransactionFields {
        match self {
            TaskPayload::NewPayment(p) => TransactionFields {
                method: "openNewPayment".to_string(),
                args: json!({
                    "purchaseId": p.purchase_id,
                    "shopId": p.shop,
                    "amount": p.amount,
                    "account": p.account,
                }),
            },
            TaskPayload::CancelPayment(p) => TransactionFields {
                method: "openCancelPayment".to_string(),
                args: json!({
                    "paymentSequence": p.target.get(),
                    "reason": p.reason,
                }),
            },
            TaskPayload::ShopAction(p) => {
                let method = match p.action {
                    ShopOp::Add => "addShop",
                    ShopOp::Update => "updateShop",
                    ShopOp::Remove => "removeShop",
                };
                TransactionFields {
                    method: method.to_string(),
                    args: json!({
                        "shopId": p.shop,
                        "provider": p.provider,
                    }),
                }
            }
        }
    }
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    let well_formed = value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !well_formed {
        return Err(ValidationError::InvalidField {
            field,
            reason: "expected 1-64 characters of [A-Za-z0-9_-]".to_string(),
        });
    }
    Ok(())
}

fn check_address(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let hex = value.strip_prefix("0x").unwrap_or("");
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidField {
            field,
            reason: "expected 0x-prefixed 20-byte hex address".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    ApprovalExhausted,
    LedgerDenied,
    ConfirmationTimeout,
}

/// Structured detail recorded when a task ends in a failure state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalReason {
    pub code: FailureCode,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub sequence: Sequence,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub transaction_handle: Option<TxHandle>,
    pub attempts: u32,
    /// An attempt has been dispatched and its approval outcome is not recorded yet.
    pub in_flight: bool,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal_reason: Option<TerminalReason>,
}

impl Task {
    pub fn opened(sequence: Sequence, payload: TaskPayload, now: DateTime<Utc>) -> Self {
        Self {
            sequence,
            status: TaskStatus::Opened,
            payload,
            transaction_handle: None,
            attempts: 0,
            in_flight: false,
            last_error: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
            terminal_reason: None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Store-level guard: whether `next` is an acceptable successor of `self`.
    ///
    /// Immutable fields must be unchanged, terminal records stay frozen, and
    /// neither the phase nor the attempt counter may go backwards.
    pub fn admits(&self, next: &Task) -> bool {
        !self.is_terminal()
            && next.sequence == self.sequence
            && next.payload == self.payload
            && next.created_at == self.created_at
            && next.status.phase() >= self.status.phase()
            && next.attempts >= self.attempts
    }
}
