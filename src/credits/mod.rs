//! Credit ledger seam and per-session credit context
//!
//! The ledger itself is an external collaborator and linearizes operations
//! for one owner. This module only guarantees that every deduct is paired
//! with either a commit (tool succeeded) or a refund.

pub mod http;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{CreditsConfig, LedgerKind};
use crate::error::LedgerError;
use crate::types::{ConversationId, OwnerId};

pub use http::HttpLedger;

/// External balance-tracking collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Whether `owner` can currently afford `amount`
    async fn check(&self, owner: &str, amount: u64) -> Result<bool, LedgerError>;

    /// Remove `amount` from the balance, returning the new balance
    async fn deduct(&self, owner: &str, amount: u64) -> Result<i64, LedgerError>;

    /// Return `amount` to the balance, returning the new balance
    async fn refund(&self, owner: &str, amount: u64) -> Result<i64, LedgerError>;

    /// Current balance
    async fn balance(&self, owner: &str) -> Result<i64, LedgerError>;
}

/// Build the ledger selected in configuration
pub fn ledger_from_config(config: &CreditsConfig) -> anyhow::Result<Arc<dyn CreditLedger>> {
    match config.ledger {
        LedgerKind::Memory => {
            let ledger = InMemoryLedger::new(config.default_balance);
            for (owner, balance) in &config.initial_balances {
                ledger.set_balance(owner, *balance);
            }
            Ok(Arc::new(ledger))
        }
        LedgerKind::Http => {
            let url = config
                .ledger_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("credits.ledger = \"http\" requires credits.ledger_url"))?;
            Ok(Arc::new(HttpLedger::new(url)?))
        }
    }
}

/// Process-local ledger. One lock for all owners, which trivially
/// linearizes concurrent sessions of the same owner.
pub struct InMemoryLedger {
    balances: Mutex<HashMap<OwnerId, i64>>,
    default_balance: i64,
}

impl InMemoryLedger {
    pub fn new(default_balance: i64) -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            default_balance,
        }
    }

    pub fn set_balance(&self, owner: &str, balance: i64) {
        if let Ok(mut balances) = self.balances.lock() {
            balances.insert(owner.to_string(), balance);
        }
    }

    fn with_balance<T>(&self, owner: &str, f: impl FnOnce(&mut i64) -> T) -> Result<T, LedgerError> {
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger lock poisoned".into()))?;
        let entry = balances.entry(owner.to_string()).or_insert(self.default_balance);
        Ok(f(entry))
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    async fn check(&self, owner: &str, amount: u64) -> Result<bool, LedgerError> {
        self.with_balance(owner, |b| *b >= amount as i64)
    }

    async fn deduct(&self, owner: &str, amount: u64) -> Result<i64, LedgerError> {
        self.with_balance(owner, |b| {
            if *b < amount as i64 {
                Err(LedgerError::Insufficient { needed: amount, available: *b })
            } else {
                *b -= amount as i64;
                Ok(*b)
            }
        })?
    }

    async fn refund(&self, owner: &str, amount: u64) -> Result<i64, LedgerError> {
        self.with_balance(owner, |b| {
            *b += amount as i64;
            *b
        })
    }

    async fn balance(&self, owner: &str) -> Result<i64, LedgerError> {
        self.with_balance(owner, |b| *b)
    }
}

const UNKNOWN_BALANCE: i64 = i64::MIN;

/// One session's view of an owner's credits
///
/// Each session builds its own context; two sessions of the same owner
/// share the ledger but never a context.
pub struct CreditContext {
    owner: OwnerId,
    conversation_id: ConversationId,
    ledger: Arc<dyn CreditLedger>,
    snapshot: AtomicI64,
    charged: AtomicU64,
}

impl CreditContext {
    pub fn new(owner: &str, conversation_id: &str, ledger: Arc<dyn CreditLedger>) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.to_string(),
            conversation_id: conversation_id.to_string(),
            ledger,
            snapshot: AtomicI64::new(UNKNOWN_BALANCE),
            charged: AtomicU64::new(0),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Last balance this session observed, if any
    pub fn snapshot(&self) -> Option<i64> {
        match self.snapshot.load(Ordering::SeqCst) {
            UNKNOWN_BALANCE => None,
            b => Some(b),
        }
    }

    /// Credits committed by this session so far
    pub fn charged_total(&self) -> u64 {
        self.charged.load(Ordering::SeqCst)
    }

    /// Fetch the balance from the ledger and update the snapshot
    pub async fn refresh(&self) -> Result<i64, LedgerError> {
        let balance = self.ledger.balance(&self.owner).await?;
        self.snapshot.store(balance, Ordering::SeqCst);
        Ok(balance)
    }

    fn observe(&self, balance: i64) {
        self.snapshot.store(balance, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Held,
    Committed,
    Released,
}

/// Credits deducted ahead of a paid tool call
///
/// Committed on success; refunded on every other exit, including drop.
pub struct CreditReservation {
    ctx: Arc<CreditContext>,
    amount: u64,
    state: ReservationState,
}

impl CreditReservation {
    /// Check and deduct `amount`. `Ok(None)` means the owner cannot afford it;
    /// nothing was deducted in that case.
    pub async fn acquire(ctx: &Arc<CreditContext>, amount: u64) -> Result<Option<Self>, LedgerError> {
        if amount == 0 {
            return Ok(Some(Self { ctx: ctx.clone(), amount, state: ReservationState::Held }));
        }

        if !ctx.ledger.check(&ctx.owner, amount).await? {
            debug!("Owner {} cannot afford {} credits", ctx.owner, amount);
            if let Ok(balance) = ctx.ledger.balance(&ctx.owner).await {
                ctx.observe(balance);
            }
            return Ok(None);
        }

        match ctx.ledger.deduct(&ctx.owner, amount).await {
            Ok(balance) => {
                ctx.observe(balance);
                Ok(Some(Self { ctx: ctx.clone(), amount, state: ReservationState::Held }))
            }
            // Another session spent the balance between check and deduct
            Err(LedgerError::Insufficient { available, .. }) => {
                ctx.observe(available);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Keep the deducted credits; returns the amount charged
    pub fn commit(mut self) -> u64 {
        self.state = ReservationState::Committed;
        self.ctx.charged.fetch_add(self.amount, Ordering::SeqCst);
        self.amount
    }

    /// Refund the deducted credits
    pub async fn release(mut self) -> Result<(), LedgerError> {
        self.state = ReservationState::Released;
        if self.amount == 0 {
            return Ok(());
        }
        let balance = self.ctx.ledger.refund(&self.ctx.owner, self.amount).await?;
        self.ctx.observe(balance);
        info!("Refunded {} credits to {}", self.amount, self.ctx.owner);
        Ok(())
    }
}

impl Drop for CreditReservation {
    fn drop(&mut self) {
        if self.state != ReservationState::Held || self.amount == 0 {
            return;
        }
        let ctx = self.ctx.clone();
        let amount = self.amount;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ctx.ledger.refund(&ctx.owner, amount).await {
                        warn!("Refund of {} credits for {} failed: {}", amount, ctx.owner, e);
                    }
                });
            }
            Err(_) => warn!("Reservation of {} credits dropped outside a runtime; not refunded", amount),
        }
    }
}
