mod balance;
mod compliance;
mod deposit;
mod dispute;
mod ledger;
mod notification;
mod order;
mod snapshot;
mod staking;
mod trade;
mod user;
mod wallet;
mod withdrawal;

pub use balance::{Balance, BalanceField};
pub use compliance::{ComplianceLog, LVCTR_THRESHOLD_CAD};
pub use deposit::Deposit;
pub use dispute::Dispute;
pub use ledger::{
    mutate_balance, BalanceMutation, EntryType, LedgerEntry, MutationOutcome,
};
pub use notification::Notification;
pub use order::{Order, OrderSide, OrderStatus, Pricing};
pub use snapshot::PortfolioSnapshot;
pub use staking::{reward_for_period, Earning, StakingPosition, StakingProduct};
pub use trade::{Trade, TradeStatus};
pub use user::{trade_limit_for_count, KycStatus, User, PLATFORM_USER_ID};
pub use wallet::Wallet;
pub use withdrawal::{Withdrawal, WithdrawalRequest};
