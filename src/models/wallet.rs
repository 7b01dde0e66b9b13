use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::chain::{Chain, ScanTarget, WalletDeriver};
use crate::crypto;
use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub chain: String,
    pub address: String,
    pub destination_tag: Option<String>,
    pub derivation_path: String,
    pub address_index: i32,
    #[serde(skip_serializing)]
    pub encrypted_private_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn chain(&self) -> Chain {
        self.chain.parse().expect("wallet row carries a valid chain")
    }

    pub async fn find_for_user(
        pool: &PgPool,
        user_id: Uuid,
        chain: Chain,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM wallets WHERE user_id = $1 AND chain = $2")
            .bind(user_id)
            .bind(chain.as_str())
            .fetch_optional(pool)
            .await
    }

    /// All assigned wallets on a chain, shaped for the deposit scanners.
    pub async fn scan_targets(pool: &PgPool, chain: Chain) -> Result<Vec<ScanTarget>, sqlx::Error> {
        let wallets = sqlx::query_as::<_, Self>(
            "SELECT * FROM wallets WHERE chain = $1 AND user_id IS NOT NULL",
        )
        .bind(chain.as_str())
        .fetch_all(pool)
        .await?;

        Ok(wallets
            .into_iter()
            .map(|w| ScanTarget {
                wallet_id: w.id,
                user_id: w.user_id.expect("filtered to assigned wallets"),
                address: w.address,
                destination_tag: w.destination_tag,
            })
            .collect())
    }

    /// Claim one unassigned pool wallet. SKIP LOCKED keeps concurrent
    /// registrations from fighting over the same row.
    async fn claim_pooled(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        chain: Chain,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "UPDATE wallets SET user_id = $1, updated_at = NOW()
             WHERE id = (
                 SELECT id FROM wallets
                 WHERE user_id IS NULL AND chain = $2
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(user_id)
        .bind(chain.as_str())
        .fetch_optional(&mut **tx)
        .await
    }

    /// Atomically advance the per-chain HD index counter.
    async fn next_index(tx: &mut Transaction<'_, Postgres>, chain: Chain) -> Result<i32, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO wallet_counters (chain, next_index) VALUES ($1, 1)
             ON CONFLICT (chain) DO UPDATE SET next_index = wallet_counters.next_index + 1
             RETURNING next_index",
        )
        .bind(chain.as_str())
        .fetch_one(&mut **tx)
        .await
    }

    /// Pool claim first, on-demand derivation as the fallback; both paths
    /// yield the same row shape. Idempotent per (user, chain).
    pub async fn provision(
        pool: &PgPool,
        user_id: Uuid,
        chain: Chain,
        deriver: &dyn WalletDeriver,
        encryption_key: &[u8; 32],
    ) -> Result<Self, CoreError> {
        if let Some(existing) = Self::find_for_user(pool, user_id, chain).await? {
            return Ok(existing);
        }

        let mut tx = pool.begin().await?;

        if let Some(claimed) = Self::claim_pooled(&mut tx, user_id, chain).await? {
            tx.commit().await?;
            return Ok(claimed);
        }

        let index = Self::next_index(&mut tx, chain).await?;
        let derived = deriver.derive(chain, index)?;
        let sealed = crypto::seal_key(encryption_key, &derived.private_key)
            .map_err(|e| CoreError::Critical(format!("wallet key sealing failed: {e}")))?;

        let wallet = sqlx::query_as::<_, Self>(
            "INSERT INTO wallets
                (user_id, chain, address, destination_tag, derivation_path,
                 address_index, encrypted_private_key)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(user_id)
        .bind(chain.as_str())
        .bind(&derived.address)
        .bind(&derived.destination_tag)
        .bind(&derived.derivation_path)
        .bind(index)
        .bind(sealed)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(wallet)
    }

    /// One wallet per chain for a fresh user.
    pub async fn provision_all(
        pool: &PgPool,
        user_id: Uuid,
        deriver: &dyn WalletDeriver,
        encryption_key: &[u8; 32],
    ) -> Result<Vec<Self>, CoreError> {
        let mut wallets = Vec::with_capacity(Chain::ALL.len());
        for chain in Chain::ALL {
            wallets.push(Self::provision(pool, user_id, chain, deriver, encryption_key).await?);
        }
        Ok(wallets)
    }
}
