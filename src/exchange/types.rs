//! Type definitions for Poloniex API commands and responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Every command the client knows how to send.
///
/// The variant decides routing: public commands are unauthenticated GETs,
/// everything else is a signed POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ReturnTicker,
    Return24hVolume,
    ReturnOrderBook,
    ReturnMarketTradeHistory,
    ReturnLoanOrders,
    ReturnBalances,
    ReturnAvailableAccountBalances,
    ReturnOpenLoanOffers,
    ReturnActiveLoans,
    ReturnLendingHistory,
    TransferBalance,
    CreateLoanOffer,
    CancelLoanOffer,
    ToggleAutoRenew,
}

impl Command {
    /// Name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::ReturnTicker => "returnTicker",
            Command::Return24hVolume => "return24hVolume",
            Command::ReturnOrderBook => "returnOrderBook",
            Command::ReturnMarketTradeHistory => "returnMarketTradeHistory",
            Command::ReturnLoanOrders => "returnLoanOrders",
            Command::ReturnBalances => "returnBalances",
            Command::ReturnAvailableAccountBalances => "returnAvailableAccountBalances",
            Command::ReturnOpenLoanOffers => "returnOpenLoanOffers",
            Command::ReturnActiveLoans => "returnActiveLoans",
            Command::ReturnLendingHistory => "returnLendingHistory",
            Command::TransferBalance => "transferBalance",
            Command::CreateLoanOffer => "createLoanOffer",
            Command::CancelLoanOffer => "cancelLoanOffer",
            Command::ToggleAutoRenew => "toggleAutoRenew",
        }
    }

    /// Name sent on the wire. Market trade history shares the public
    /// `returnTradeHistory` command with the private account endpoint.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Command::ReturnMarketTradeHistory => "returnTradeHistory",
            other => other.as_str(),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Command::ReturnTicker
                | Command::Return24hVolume
                | Command::ReturnOrderBook
                | Command::ReturnMarketTradeHistory
                | Command::ReturnLoanOrders
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange sub-account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Account {
    Exchange,
    Margin,
    Lending,
}

impl Account {
    pub fn as_str(&self) -> &'static str {
        match self {
            Account::Exchange => "exchange",
            Account::Margin => "margin",
            Account::Lending => "lending",
        }
    }
}

/// Ticker for one currency pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    #[serde(with = "rust_decimal::serde::str")]
    pub last: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub lowest_ask: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub highest_bid: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub base_volume: Option<Decimal>,
}

/// One entry on the loan order book.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanOrder {
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub range_min: u32,
    pub range_max: u32,
}

/// Public loan order book for one currency.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoanOrders {
    #[serde(default)]
    pub offers: Vec<LoanOrder>,
    #[serde(default)]
    pub demands: Vec<LoanOrder>,
}

impl LoanOrders {
    /// Cheapest rate currently offered by lenders.
    pub fn lowest_offer_rate(&self) -> Option<Decimal> {
        self.offers.iter().map(|o| o.rate).min()
    }
}

/// One of our own open loan offers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenLoanOffer {
    pub id: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub duration: u32,
    pub auto_renew: u8,
    pub date: String,
}

/// A loan currently provided to a borrower.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveLoan {
    pub id: u64,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub range: u32,
    pub auto_renew: u8,
    pub date: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub fees: Option<Decimal>,
}

/// Loans we provide and loans we use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActiveLoans {
    #[serde(default)]
    pub provided: Vec<ActiveLoan>,
    #[serde(default)]
    pub used: Vec<ActiveLoan>,
}

/// Finished loan from lending history.
#[derive(Debug, Clone, Deserialize)]
pub struct LendingHistoryEntry {
    pub id: u64,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub interest: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub fee: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub earned: Decimal,
    pub open: String,
    pub close: String,
}

/// Acknowledgement returned by mutating commands.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    #[serde(default)]
    pub success: u8,
    #[serde(default)]
    pub message: serde_json::Value,
    #[serde(default, rename = "orderID")]
    pub order_id: Option<u64>,
}

impl CommandAck {
    pub fn is_success(&self) -> bool {
        self.success == 1
    }
}

/// Currency -> amount.
pub type Balances = HashMap<String, Decimal>;

/// Account -> (currency -> amount).
pub type AccountBalances = HashMap<Account, Balances>;

/// Currency -> our open offers.
pub type OpenLoanOffers = HashMap<String, Vec<OpenLoanOffer>>;

/// Poloniex returns `[]` instead of `{}` for empty objects. Decode either
/// into `T`, mapping the empty list to `T::default()`.
pub(crate) fn decode_lenient<T>(value: serde_json::Value) -> serde_json::Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    match value {
        serde_json::Value::Array(ref items) if items.is_empty() => Ok(T::default()),
        other => serde_json::from_value(other),
    }
}
