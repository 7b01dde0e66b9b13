use rust_decimal::Decimal;

use crate::models::LedgerEntry;

/// Total fee for a trade, with the per-side halves that land as separate
/// fee_credit ledger rows. fee_percent is the all-in rate; each side pays
/// half, rounded up to 8 decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub fee_amount: Decimal,
    pub buyer_half: Decimal,
    pub seller_half: Decimal,
}

pub fn compute_fee(amount_crypto: Decimal, fee_percent: Decimal) -> FeeBreakdown {
    let per_side =
        LedgerEntry::round_crypto_up(amount_crypto * fee_percent / Decimal::from(100) / Decimal::from(2));
    FeeBreakdown {
        fee_amount: per_side + per_side,
        buyer_half: per_side,
        seller_half: per_side,
    }
}

/// Re-split a stored fee_amount into halves (fee credits can leave an odd
/// remainder; the seller side absorbs it).
pub fn split_halves(fee_amount: Decimal) -> (Decimal, Decimal) {
    let buyer_half = (fee_amount / Decimal::from(2)).round_dp(8);
    (buyer_half, fee_amount - buyer_half)
}

/// Convert a CAD fee credit into a crypto fee discount at the trade price.
/// Returns the reduced fee and the CAD actually consumed; both sides are
/// computed so the deduction is exact at fiat precision.
pub fn apply_fee_credit(
    fee_amount: Decimal,
    credit_cad: Decimal,
    price_per_unit: Decimal,
) -> (Decimal, Decimal) {
    if credit_cad <= Decimal::ZERO || fee_amount <= Decimal::ZERO || price_per_unit <= Decimal::ZERO
    {
        return (fee_amount, Decimal::ZERO);
    }

    let fee_cad = LedgerEntry::round_fiat(fee_amount * price_per_unit);
    let used_cad = credit_cad.min(fee_cad);
    let discount = LedgerEntry::round_crypto(used_cad / price_per_unit);
    let new_fee = (fee_amount - discount).max(Decimal::ZERO);
    (new_fee, used_cad)
}
