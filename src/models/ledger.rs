use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::balance::BalanceField;
use super::user::PLATFORM_USER_ID;
use crate::chain::Asset;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    DepositPending,
    DepositPendingCleared,
    DepositConfirmed,
    WithdrawalRequested,
    WithdrawalCancelled,
    WithdrawalFailed,
    WithdrawalRejected,
    TradeEscrowLock,
    TradeEscrowRelease,
    TradeEscrowReturn,
    TradeCredit,
    FeeCredit,
    StakingLock,
    StakingUnlock,
    StakingReward,
    AdminAdjustment,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryType::DepositPending => "deposit_pending",
            EntryType::DepositPendingCleared => "deposit_pending_cleared",
            EntryType::DepositConfirmed => "deposit_confirmed",
            EntryType::WithdrawalRequested => "withdrawal_requested",
            EntryType::WithdrawalCancelled => "withdrawal_cancelled",
            EntryType::WithdrawalFailed => "withdrawal_failed",
            EntryType::WithdrawalRejected => "withdrawal_rejected",
            EntryType::TradeEscrowLock => "trade_escrow_lock",
            EntryType::TradeEscrowRelease => "trade_escrow_release",
            EntryType::TradeEscrowReturn => "trade_escrow_return",
            EntryType::TradeCredit => "trade_credit",
            EntryType::FeeCredit => "fee_credit",
            EntryType::StakingLock => "staking_lock",
            EntryType::StakingUnlock => "staking_unlock",
            EntryType::StakingReward => "staking_reward",
            EntryType::AdminAdjustment => "admin_adjustment",
        };
        f.write_str(s)
    }
}

/// Append-only audit row. One per balance mutation, always.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset: String,
    pub entry_type: String,
    pub field: String,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub deposit_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub trade_id: Option<Uuid>,
    pub idempotency_key: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single balance mutation. `amount` is signed: credit positive, debit
/// negative. The idempotency key convention is `{domain}:{refId}:{step}`.
#[derive(Debug, Clone)]
pub struct BalanceMutation {
    pub user_id: Uuid,
    pub asset: Asset,
    pub field: BalanceField,
    pub amount: Decimal,
    pub entry_type: EntryType,
    pub idempotency_key: String,
    pub deposit_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub trade_id: Option<Uuid>,
    pub note: Option<String>,
    pub allow_negative: bool,
}

impl BalanceMutation {
    pub fn new(
        user_id: Uuid,
        asset: Asset,
        field: BalanceField,
        amount: Decimal,
        entry_type: EntryType,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            asset,
            field,
            amount,
            entry_type,
            idempotency_key: idempotency_key.into(),
            deposit_id: None,
            withdrawal_id: None,
            trade_id: None,
            note: None,
            allow_negative: false,
        }
    }

    pub fn for_trade(mut self, trade_id: Uuid) -> Self {
        self.trade_id = Some(trade_id);
        self
    }

    pub fn for_deposit(mut self, deposit_id: Uuid) -> Self {
        self.deposit_id = Some(deposit_id);
        self
    }

    pub fn for_withdrawal(mut self, withdrawal_id: Uuid) -> Self {
        self.withdrawal_id = Some(withdrawal_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Platform user only; the engine rejects it for anyone else.
    pub fn allowing_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }
}

#[derive(Debug)]
pub enum MutationOutcome {
    Applied(LedgerEntry),
    /// The idempotency key was already written; the call was a no-op.
    Replayed,
}

impl MutationOutcome {
    pub fn is_replay(&self) -> bool {
        matches!(self, MutationOutcome::Replayed)
    }
}

/// The only code path allowed to change a balance row. Runs inside the
/// caller's transaction so balance + ledger + the caller's own writes commit
/// or vanish together.
pub async fn mutate_balance(
    tx: &mut Transaction<'_, Postgres>,
    m: BalanceMutation,
) -> Result<MutationOutcome, CoreError> {
    if m.allow_negative && m.user_id != PLATFORM_USER_ID {
        return Err(CoreError::PermissionDenied(
            "allow_negative is reserved for the platform user".into(),
        ));
    }

    // Lock the balance row before the replay check: a concurrent call with
    // the same key queues here and sees the committed ledger row afterwards.
    let balance = super::Balance::lock(tx, m.user_id, m.asset)
        .await?
        .ok_or(CoreError::NoBalanceRow {
            user_id: m.user_id,
            asset: m.asset.as_str().to_string(),
        })?;

    let existing: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM balance_ledger WHERE idempotency_key = $1")
            .bind(&m.idempotency_key)
            .fetch_optional(&mut **tx)
            .await?;
    if existing.is_some() {
        return Ok(MutationOutcome::Replayed);
    }

    let current = balance.field(m.field);
    let new_value = current + m.amount;
    if new_value < Decimal::ZERO && !m.allow_negative {
        return Err(CoreError::InsufficientFunds {
            available: current,
            required: -m.amount,
        });
    }

    let update = format!(
        "UPDATE balances SET {} = $1, updated_at = NOW() WHERE user_id = $2 AND asset = $3",
        m.field.column()
    );
    sqlx::query(&update)
        .bind(new_value)
        .bind(m.user_id)
        .bind(m.asset.as_str())
        .execute(&mut **tx)
        .await?;

    let entry = sqlx::query_as::<_, LedgerEntry>(
        "INSERT INTO balance_ledger
            (user_id, asset, entry_type, field, amount, balance_after,
             deposit_id, withdrawal_id, trade_id, idempotency_key, note)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         RETURNING *",
    )
    .bind(m.user_id)
    .bind(m.asset.as_str())
    .bind(m.entry_type.to_string())
    .bind(m.field.column())
    .bind(m.amount)
    .bind(new_value)
    .bind(m.deposit_id)
    .bind(m.withdrawal_id)
    .bind(m.trade_id)
    .bind(&m.idempotency_key)
    .bind(&m.note)
    .fetch_one(&mut **tx)
    .await?;

    Ok(MutationOutcome::Applied(entry))
}

impl LedgerEntry {
    /// Crypto amounts are carried at 8 decimals on user-facing paths.
    pub fn round_crypto(amount: Decimal) -> Decimal {
        amount.round_dp(8)
    }

    /// Fees always round against the user, up to 8 decimals.
    pub fn round_crypto_up(amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(8, RoundingStrategy::AwayFromZero)
    }

    pub fn round_fiat(amount: Decimal) -> Decimal {
        amount.round_dp(2)
    }

    pub async fn history(
        pool: &PgPool,
        user_id: Uuid,
        asset: Asset,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM balance_ledger
             WHERE user_id = $1 AND asset = $2
             ORDER BY created_at DESC, id DESC
             LIMIT $3",
        )
        .bind(user_id)
        .bind(asset.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Replay one field of one balance from the ledger (reconciliation).
    pub async fn derive_field(
        pool: &PgPool,
        user_id: Uuid,
        asset: Asset,
        field: BalanceField,
    ) -> Result<Decimal, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM balance_ledger
             WHERE user_id = $1 AND asset = $2 AND field = $3",
        )
        .bind(user_id)
        .bind(asset.as_str())
        .bind(field.column())
        .fetch_one(pool)
        .await
    }

    /// True when all three cached fields equal their ledger replay.
    pub async fn reconcile(
        pool: &PgPool,
        user_id: Uuid,
        asset: Asset,
    ) -> Result<bool, sqlx::Error> {
        let balance = super::Balance::get(pool, user_id, asset).await?;
        for field in [
            BalanceField::Available,
            BalanceField::Locked,
            BalanceField::PendingDeposit,
        ] {
            let derived = Self::derive_field(pool, user_id, asset, field).await?;
            let cached = balance.as_ref().map(|b| b.field(field)).unwrap_or_default();
            if derived != cached {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// System-wide conservation check for one asset and field: the sum of
    /// signed ledger amounts must equal the sum of cached balances.
    pub async fn conserves(
        pool: &PgPool,
        asset: Asset,
        field: BalanceField,
    ) -> Result<bool, sqlx::Error> {
        let ledger_sum: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM balance_ledger
             WHERE asset = $1 AND field = $2",
        )
        .bind(asset.as_str())
        .bind(field.column())
        .fetch_one(pool)
        .await?;

        let column = field.column();
        let balance_sum: Decimal = sqlx::query_scalar(&format!(
            "SELECT COALESCE(SUM({column}), 0) FROM balances WHERE asset = $1"
        ))
        .bind(asset.as_str())
        .fetch_one(pool)
        .await?;

        Ok(ledger_sum == balance_sum)
    }
}
