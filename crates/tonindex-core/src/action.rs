//! Action vocabulary — the versioned schema contract for classified actions.
//!
//! Classification rules emit a [`RawActionFields`] record (a flat superset of
//! every action's fields) together with an [`ActionKind`].
//! [`ActionDetails::from_raw`] turns that into the typed, per-kind payload and
//! applies the kind-level refinements (extra-currency transfers, provider-
//! specific staking fields, the tonco swap subtype).
//!
//! Tags are stable: new kinds get new variants, existing tags never change
//! meaning. Bump [`ACTION_VOCABULARY_VERSION`] when the field set of an
//! existing kind grows.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::Address;

pub const ACTION_VOCABULARY_VERSION: u32 = 1;

macro_rules! action_kinds {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Type tag of an action.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ActionKind {
            $(#[serde(rename = $tag)] $variant,)+
        }

        impl ActionKind {
            /// Every known kind, in tag declaration order.
            pub const ALL: &'static [ActionKind] = &[$(ActionKind::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ActionKind::$variant => $tag,)+
                }
            }
        }
    };
}

action_kinds! {
    CallContract => "call_contract",
    ContractDeploy => "contract_deploy",
    TonTransfer => "ton_transfer",
    ExtraCurrencyTransfer => "extra_currency_transfer",
    AuctionBid => "auction_bid",
    ChangeDns => "change_dns",
    DeleteDns => "delete_dns",
    RenewDns => "renew_dns",
    DexDepositLiquidity => "dex_deposit_liquidity",
    DexWithdrawLiquidity => "dex_withdraw_liquidity",
    ElectionDeposit => "election_deposit",
    ElectionRecover => "election_recover",
    JettonBurn => "jetton_burn",
    JettonSwap => "jetton_swap",
    JettonTransfer => "jetton_transfer",
    JettonMint => "jetton_mint",
    NftMint => "nft_mint",
    NftTransfer => "nft_transfer",
    NftDiscovery => "nft_discovery",
    TickTock => "tick_tock",
    StakeDeposit => "stake_deposit",
    StakeWithdrawal => "stake_withdrawal",
    StakeWithdrawalRequest => "stake_withdrawal_request",
    Subscribe => "subscribe",
    Unsubscribe => "unsubscribe",
    MultisigCreateOrder => "multisig_create_order",
    MultisigApprove => "multisig_approve",
    MultisigExecute => "multisig_execute",
    VestingSendMessage => "vesting_send_message",
    VestingAddWhitelist => "vesting_add_whitelist",
    EvaaSupply => "evaa_supply",
    EvaaWithdraw => "evaa_withdraw",
    EvaaLiquidate => "evaa_liquidate",
    JvaultClaim => "jvault_claim",
    JvaultStake => "jvault_stake",
    JvaultUnstake => "jvault_unstake",
    JvaultUnstakeRequest => "jvault_unstake_request",
    TgbtcMint => "tgbtc_mint",
    TgbtcMintFallback => "tgbtc_mint_fallback",
    TgbtcBurn => "tgbtc_burn",
    TgbtcBurnFallback => "tgbtc_burn_fallback",
    TgbtcNewKey => "tgbtc_new_key",
    TgbtcNewKeyFallback => "tgbtc_new_key_fallback",
    TgbtcDkgLogFallback => "tgbtc_dkg_log_fallback",
    ToncoDeployPool => "tonco_deploy_pool",
    CoffeeCreatePool => "coffee_create_pool",
    CoffeeCreatePoolCreator => "coffee_create_pool_creator",
    CoffeeStakingDeposit => "coffee_staking_deposit",
    CoffeeStakingWithdraw => "coffee_staking_withdraw",
    CoffeeStakingClaimRewards => "coffee_staking_claim_rewards",
    CoffeeMevProtectHoldFunds => "coffee_mev_protect_hold_funds",
    CoffeeCreateVault => "coffee_create_vault",
    Unknown => "unknown",
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unsupported action type: '{s}'"))
    }
}

// ─── Raw fields ──────────────────────────────────────────────────────────────

/// Flat field record produced by classification rules.
///
/// The role columns (`source`, `destination`, their secondaries, `asset`,
/// `asset2`) mean different things per kind; [`ActionDetails::from_raw`]
/// assigns them. Kind-specific scalars go into `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawActionFields {
    pub source: Option<Address>,
    pub source_secondary: Option<Address>,
    pub destination: Option<Address>,
    pub destination_secondary: Option<Address>,
    pub asset: Option<Address>,
    pub asset_secondary: Option<Address>,
    pub asset2: Option<Address>,
    /// Token amount as a decimal string.
    pub amount: Option<String>,
    /// Attached TON value in nanotons.
    pub value: Option<u64>,
    pub opcode: Option<u32>,
    #[serde(default)]
    pub extra_currencies: BTreeMap<u32, String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawActionFields {
    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) -> &mut Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Copy `key` from a decoded-field map if present.
    pub fn copy_from(&mut self, decoded: &serde_json::Map<String, serde_json::Value>, key: &str) -> &mut Self {
        if let Some(v) = decoded.get(key) {
            self.fields.insert(key.to_string(), v.clone());
        }
        self
    }

    pub fn str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.fields.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key)?.as_bool()
    }

    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn typed<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ─── Per-kind details ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallContractDetails {
    pub opcode: Option<u32>,
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub value: Option<u64>,
    pub extra_currencies: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractDeployDetails {
    pub opcode: Option<u32>,
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub value: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TonTransferDetails {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub value: Option<u64>,
    pub comment: Option<String>,
    pub encrypted: bool,
    pub extra_currencies: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuctionBidDetails {
    pub bidder: Option<Address>,
    pub auction: Option<Address>,
    pub amount: Option<u64>,
    pub nft_item: Option<Address>,
    pub nft_collection: Option<Address>,
    pub nft_item_index: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsValue {
    pub sum_type: Option<String>,
    pub dns_next_resolver_address: Option<Address>,
    pub dns_adnl_address: Option<String>,
    pub dns_smc_address: Option<Address>,
    pub dns_storage_address: Option<String>,
    pub dns_text: Option<String>,
    pub flags: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeDnsDetails {
    pub key: Option<String>,
    pub value: DnsValue,
    pub source: Option<Address>,
    pub asset: Option<Address>,
    pub nft_collection: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteDnsDetails {
    pub key: Option<String>,
    pub source: Option<Address>,
    pub asset: Option<Address>,
    pub nft_collection: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenewDnsDetails {
    pub source: Option<Address>,
    pub asset: Option<Address>,
    pub nft_collection: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultExcess {
    pub asset: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DexDepositLiquidityDetails {
    pub source: Option<Address>,
    pub dex: Option<String>,
    pub pool: Option<Address>,
    pub destination_liquidity: Option<Address>,
    pub asset_1: Option<Address>,
    pub asset_2: Option<Address>,
    pub amount_1: Option<String>,
    pub amount_2: Option<String>,
    pub user_jetton_wallet_1: Option<Address>,
    pub user_jetton_wallet_2: Option<Address>,
    pub lp_tokens_minted: Option<String>,
    pub target_asset_1: Option<Address>,
    pub target_asset_2: Option<Address>,
    pub target_amount_1: Option<String>,
    pub target_amount_2: Option<String>,
    pub tick_lower: Option<i64>,
    pub tick_upper: Option<i64>,
    pub nft_index: Option<u64>,
    pub nft_address: Option<Address>,
    pub vault_excesses: Vec<VaultExcess>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DexWithdrawLiquidityDetails {
    pub source: Option<Address>,
    pub dex: Option<String>,
    pub pool: Option<Address>,
    pub destination_liquidity: Option<Address>,
    pub asset_1: Option<Address>,
    pub asset_2: Option<Address>,
    pub amount_1: Option<String>,
    pub amount_2: Option<String>,
    pub user_jetton_wallet_1: Option<Address>,
    pub user_jetton_wallet_2: Option<Address>,
    pub lp_tokens_burnt: Option<String>,
    pub burnt_nft_index: Option<u64>,
    pub burnt_nft_address: Option<Address>,
    pub tick_lower: Option<i64>,
    pub tick_upper: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectionDetails {
    pub stake_holder: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JettonBurnDetails {
    pub owner: Option<Address>,
    pub owner_jetton_wallet: Option<Address>,
    pub asset: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JettonSwapTransfer {
    pub asset: Option<Address>,
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub source_jetton_wallet: Option<Address>,
    pub destination_jetton_wallet: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSwap {
    pub asset_in: Option<Address>,
    pub amount_in: Option<String>,
    pub asset_out: Option<Address>,
    pub amount_out: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JettonSwapDetails {
    pub dex: Option<String>,
    pub sender: Option<Address>,
    pub asset_in: Option<Address>,
    pub asset_out: Option<Address>,
    pub dex_incoming_transfer: JettonSwapTransfer,
    pub dex_outgoing_transfer: JettonSwapTransfer,
    pub peer_swaps: Vec<PeerSwap>,
}

/// A swap on the one DEX that reports the user's minimum output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToncoJettonSwapDetails {
    #[serde(flatten)]
    pub swap: JettonSwapDetails,
    pub min_out_amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JettonTransferDetails {
    pub asset: Option<Address>,
    pub sender: Option<Address>,
    pub sender_jetton_wallet: Option<Address>,
    pub receiver: Option<Address>,
    pub receiver_jetton_wallet: Option<Address>,
    pub amount: Option<String>,
    pub comment: Option<String>,
    pub is_encrypted_comment: Option<bool>,
    pub query_id: Option<u64>,
    pub response_destination: Option<Address>,
    pub custom_payload: Option<String>,
    pub forward_payload: Option<String>,
    pub forward_amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JettonMintDetails {
    pub asset: Option<Address>,
    pub amount: Option<String>,
    pub ton_amount: Option<u64>,
    pub receiver: Option<Address>,
    pub receiver_jetton_wallet: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NftMintDetails {
    pub owner: Option<Address>,
    pub nft_collection: Option<Address>,
    pub nft_item: Option<Address>,
    pub nft_item_index: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NftTransferDetails {
    pub nft_collection: Option<Address>,
    pub nft_item: Option<Address>,
    pub nft_item_index: Option<String>,
    pub old_owner: Option<Address>,
    pub new_owner: Option<Address>,
    pub is_purchase: Option<bool>,
    pub price: Option<String>,
    pub query_id: Option<u64>,
    pub response_destination: Option<Address>,
    pub custom_payload: Option<String>,
    pub forward_payload: Option<String>,
    pub forward_amount: Option<String>,
    pub comment: Option<String>,
    pub is_encrypted_comment: Option<bool>,
    pub marketplace: Option<String>,
    pub real_old_owner: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NftDiscoveryDetails {
    pub source: Option<Address>,
    pub nft_item: Option<Address>,
    pub nft_collection: Option<Address>,
    pub nft_item_index: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StakeDepositDetails {
    pub stake_holder: Option<Address>,
    pub amount: Option<String>,
    pub pool: Option<Address>,
    pub provider: Option<String>,
    pub tokens_minted: Option<String>,
    pub asset: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StakeWithdrawalDetails {
    pub stake_holder: Option<Address>,
    pub amount: Option<String>,
    pub pool: Option<Address>,
    pub provider: Option<String>,
    pub payout_nft: Option<Address>,
    pub tokens_burnt: Option<String>,
    pub asset: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StakeWithdrawalRequestDetails {
    pub stake_holder: Option<Address>,
    pub pool: Option<Address>,
    pub provider: Option<String>,
    pub payout_nft: Option<Address>,
    pub tokens_burnt: Option<String>,
    pub asset: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub subscriber: Option<Address>,
    pub beneficiary: Option<Address>,
    pub subscription: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultisigCreateOrderDetails {
    pub query_id: Option<u64>,
    pub order_seqno: Option<String>,
    pub is_created_by_signer: Option<bool>,
    pub is_signed_by_creator: Option<bool>,
    pub creator_index: Option<u64>,
    pub expiration_date: Option<u64>,
    pub order_boc: Option<String>,
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub destination_order: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultisigApproveDetails {
    pub signer_index: Option<u64>,
    pub exit_code: Option<i64>,
    pub source: Option<Address>,
    pub destination: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultisigExecuteDetails {
    pub query_id: Option<u64>,
    pub order_seqno: Option<String>,
    pub expiration_date: Option<u64>,
    pub approvals_num: Option<u64>,
    pub signers_hash: Option<String>,
    pub order_boc: Option<String>,
    pub source: Option<Address>,
    pub destination: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VestingSendMessageDetails {
    pub query_id: Option<u64>,
    pub message_boc: Option<String>,
    pub source: Option<Address>,
    pub vesting: Option<Address>,
    pub destination: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VestingAddWhitelistDetails {
    pub query_id: Option<u64>,
    pub accounts_added: Vec<Address>,
    pub source: Option<Address>,
    pub vesting: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaaSupplyDetails {
    pub sender_jetton_wallet: Option<Address>,
    pub recipient_jetton_wallet: Option<Address>,
    pub master_jetton_wallet: Option<Address>,
    pub master: Option<Address>,
    pub asset_id: Option<String>,
    pub is_ton: Option<bool>,
    pub source: Option<Address>,
    pub source_wallet: Option<Address>,
    pub recipient: Option<Address>,
    pub recipient_contract: Option<Address>,
    pub asset: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaaWithdrawDetails {
    pub recipient_jetton_wallet: Option<Address>,
    pub master_jetton_wallet: Option<Address>,
    pub master: Option<Address>,
    pub fail_reason: Option<String>,
    pub asset_id: Option<String>,
    pub source: Option<Address>,
    pub recipient: Option<Address>,
    pub owner_contract: Option<Address>,
    pub asset: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaaLiquidateDetails {
    pub fail_reason: Option<String>,
    pub debt_amount: Option<String>,
    pub source: Option<Address>,
    pub borrower: Option<Address>,
    pub borrower_contract: Option<Address>,
    pub collateral: Option<Address>,
    pub asset_id: Option<String>,
    pub amount: Option<String>,
    /// Canonical asset address resolved from `asset_id`.
    pub asset: Option<Address>,
    pub is_known_asset: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JettonAmount {
    pub jetton: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JvaultClaimDetails {
    pub claimed_rewards: Vec<JettonAmount>,
    pub source: Option<Address>,
    pub stake_wallet: Option<Address>,
    pub pool: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JvaultStakeDetails {
    pub period: Option<u64>,
    pub minted_stake_jettons: Option<String>,
    pub stake_wallet: Option<Address>,
    pub source: Option<Address>,
    pub source_jetton_wallet: Option<Address>,
    pub asset: Option<Address>,
    pub pool: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JvaultUnstakeDetails {
    pub source: Option<Address>,
    pub stake_wallet: Option<Address>,
    pub pool: Option<Address>,
    pub amount: Option<String>,
    pub exit_code: Option<i64>,
    pub asset: Option<Address>,
    pub staking_asset: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TgbtcMintDetails {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub destination_wallet: Option<Address>,
    pub amount: Option<String>,
    pub asset: Option<Address>,
    pub bitcoin_txid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TgbtcBurnDetails {
    pub source: Option<Address>,
    pub source_wallet: Option<Address>,
    pub destination: Option<Address>,
    pub amount: Option<String>,
    pub asset: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TgbtcNewKeyDetails {
    pub source: Option<Address>,
    pub pubkey: Option<String>,
    pub coordinator: Option<Address>,
    pub pegout: Option<Address>,
    pub amount: Option<String>,
    pub asset: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TgbtcDkgLogDetails {
    pub coordinator: Option<Address>,
    pub pubkey: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToncoDeployPoolDetails {
    pub source: Option<Address>,
    pub pool: Option<Address>,
    pub router: Option<Address>,
    pub router_jetton_wallet_1: Option<Address>,
    pub router_jetton_wallet_2: Option<Address>,
    pub jetton_minter_1: Option<Address>,
    pub jetton_minter_2: Option<Address>,
    pub tick_spacing: Option<i64>,
    pub initial_price_x96: Option<String>,
    pub protocol_fee: Option<u64>,
    pub lp_fee_base: Option<u64>,
    pub lp_fee_current: Option<u64>,
    pub pool_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoffeeCreatePoolDetails {
    pub source: Option<Address>,
    pub source_jetton_wallet: Option<Address>,
    pub initiator_1: Option<Address>,
    pub initiator_2: Option<Address>,
    pub provided_asset: Option<Address>,
    pub amount: Option<String>,
    pub pool: Option<Address>,
    pub asset_1: Option<Address>,
    pub asset_2: Option<Address>,
    pub amount_1: Option<String>,
    pub amount_2: Option<String>,
    pub lp_tokens_minted: Option<String>,
    pub pool_creator_contract: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoffeeCreatePoolCreatorDetails {
    pub source: Option<Address>,
    pub source_jetton_wallet: Option<Address>,
    pub deposit_recipient: Option<Address>,
    pub pool_creator_contract: Option<Address>,
    pub provided_asset: Option<Address>,
    pub asset_1: Option<Address>,
    pub asset_2: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoffeeStakingDepositDetails {
    pub source: Option<Address>,
    pub source_jetton_wallet: Option<Address>,
    pub pool: Option<Address>,
    pub pool_jetton_wallet: Option<Address>,
    pub asset: Option<Address>,
    pub amount: Option<String>,
    pub minted_item_address: Option<Address>,
    pub minted_item_index: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoffeeStakingWithdrawDetails {
    pub source: Option<Address>,
    pub source_jetton_wallet: Option<Address>,
    pub pool: Option<Address>,
    pub pool_jetton_wallet: Option<Address>,
    pub asset: Option<Address>,
    pub amount: Option<String>,
    pub nft_address: Option<Address>,
    pub nft_index: Option<u64>,
    pub points: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoffeeStakingClaimRewardsDetails {
    pub pool: Option<Address>,
    pub pool_jetton_wallet: Option<Address>,
    pub recipient: Option<Address>,
    pub recipient_jetton_wallet: Option<Address>,
    pub asset: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoffeeMevProtectHoldFundsDetails {
    pub source: Option<Address>,
    pub source_jetton_wallet: Option<Address>,
    pub mev_contract: Option<Address>,
    pub mev_contract_jetton_wallet: Option<Address>,
    pub asset: Option<Address>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoffeeCreateVaultDetails {
    pub source: Option<Address>,
    pub vault: Option<Address>,
    pub asset: Option<Address>,
    pub value: Option<u64>,
}

/// Fallback payload: the raw fields plus a diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnknownDetails {
    pub error: String,
    pub raw: RawActionFields,
}

// ─── Details sum type ────────────────────────────────────────────────────────

/// Typed payload of an action, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDetails {
    CallContract(CallContractDetails),
    ContractDeploy(ContractDeployDetails),
    TonTransfer(TonTransferDetails),
    ExtraCurrencyTransfer(TonTransferDetails),
    AuctionBid(AuctionBidDetails),
    ChangeDns(ChangeDnsDetails),
    DeleteDns(DeleteDnsDetails),
    RenewDns(RenewDnsDetails),
    DexDepositLiquidity(DexDepositLiquidityDetails),
    DexWithdrawLiquidity(DexWithdrawLiquidityDetails),
    ElectionDeposit(ElectionDetails),
    ElectionRecover(ElectionDetails),
    JettonBurn(JettonBurnDetails),
    JettonSwap(JettonSwapDetails),
    ToncoJettonSwap(ToncoJettonSwapDetails),
    JettonTransfer(JettonTransferDetails),
    JettonMint(JettonMintDetails),
    NftMint(NftMintDetails),
    NftTransfer(NftTransferDetails),
    NftDiscovery(NftDiscoveryDetails),
    TickTock,
    StakeDeposit(StakeDepositDetails),
    StakeWithdrawal(StakeWithdrawalDetails),
    StakeWithdrawalRequest(StakeWithdrawalRequestDetails),
    Subscribe(SubscriptionDetails),
    Unsubscribe(SubscriptionDetails),
    MultisigCreateOrder(MultisigCreateOrderDetails),
    MultisigApprove(MultisigApproveDetails),
    MultisigExecute(MultisigExecuteDetails),
    VestingSendMessage(VestingSendMessageDetails),
    VestingAddWhitelist(VestingAddWhitelistDetails),
    EvaaSupply(EvaaSupplyDetails),
    EvaaWithdraw(EvaaWithdrawDetails),
    EvaaLiquidate(EvaaLiquidateDetails),
    JvaultClaim(JvaultClaimDetails),
    JvaultStake(JvaultStakeDetails),
    JvaultUnstake(JvaultUnstakeDetails),
    JvaultUnstakeRequest(JvaultUnstakeDetails),
    TgbtcMint(TgbtcMintDetails),
    TgbtcMintFallback(TgbtcMintDetails),
    TgbtcBurn(TgbtcBurnDetails),
    TgbtcBurnFallback(TgbtcBurnDetails),
    TgbtcNewKey(TgbtcNewKeyDetails),
    TgbtcNewKeyFallback(TgbtcNewKeyDetails),
    TgbtcDkgLogFallback(TgbtcDkgLogDetails),
    ToncoDeployPool(ToncoDeployPoolDetails),
    CoffeeCreatePool(CoffeeCreatePoolDetails),
    CoffeeCreatePoolCreator(CoffeeCreatePoolCreatorDetails),
    CoffeeStakingDeposit(CoffeeStakingDepositDetails),
    CoffeeStakingWithdraw(CoffeeStakingWithdrawDetails),
    CoffeeStakingClaimRewards(CoffeeStakingClaimRewardsDetails),
    CoffeeMevProtectHoldFunds(CoffeeMevProtectHoldFundsDetails),
    CoffeeCreateVault(CoffeeCreateVaultDetails),
    Unknown(UnknownDetails),
}

/// Resolves EVAA asset ids to canonical asset addresses.
pub trait AssetResolver {
    fn resolve_evaa_asset(&self, asset_id: &str) -> Option<Address>;
}

impl AssetResolver for () {
    fn resolve_evaa_asset(&self, _asset_id: &str) -> Option<Address> {
        None
    }
}

fn swap_transfer(raw: &RawActionFields, prefix: &str) -> JettonSwapTransfer {
    let key = |k: &str| format!("{prefix}_{k}");
    JettonSwapTransfer {
        asset: raw.str(&key("asset")),
        source: raw.str(&key("source")),
        destination: raw.str(&key("destination")),
        source_jetton_wallet: raw.str(&key("source_jetton_wallet")),
        destination_jetton_wallet: raw.str(&key("destination_jetton_wallet")),
        amount: raw.str(&key("amount")),
    }
}

impl ActionDetails {
    /// Build the typed payload for `kind` from a raw field record.
    pub fn from_raw(kind: ActionKind, raw: &RawActionFields, assets: &dyn AssetResolver) -> Self {
        use ActionKind as K;
        let r = raw;
        match kind {
            K::CallContract | K::TonTransfer if !r.extra_currencies.is_empty() => {
                Self::ExtraCurrencyTransfer(ton_transfer(r))
            }
            K::ExtraCurrencyTransfer => Self::ExtraCurrencyTransfer(ton_transfer(r)),
            K::TonTransfer => Self::TonTransfer(ton_transfer(r)),
            K::CallContract => Self::CallContract(CallContractDetails {
                opcode: r.opcode,
                source: r.source.clone(),
                destination: r.destination.clone(),
                value: r.value,
                extra_currencies: r.extra_currencies.clone(),
            }),
            K::ContractDeploy => Self::ContractDeploy(ContractDeployDetails {
                opcode: r.opcode,
                source: r.source.clone(),
                destination: r.destination.clone(),
                value: r.value,
            }),
            K::AuctionBid => Self::AuctionBid(AuctionBidDetails {
                bidder: r.source.clone(),
                auction: r.destination.clone(),
                amount: r.value,
                nft_item: r.asset_secondary.clone(),
                nft_collection: r.asset.clone(),
                nft_item_index: r.str("nft_item_index"),
            }),
            K::ChangeDns => {
                let schema = r.str("dns_value_schema");
                let value = r.str("dns_value");
                let mut dns = DnsValue {
                    sum_type: schema.clone(),
                    flags: r.u64("dns_flags").map(|f| f as u32),
                    ..DnsValue::default()
                };
                match schema.as_deref() {
                    Some("DNSNextResolver") => dns.dns_next_resolver_address = value,
                    Some("DNSAdnlAddress") => dns.dns_adnl_address = value,
                    Some("DNSSmcAddress") => dns.dns_smc_address = value,
                    Some("DNSStorageAddress") => dns.dns_storage_address = value,
                    Some("DNSText") => dns.dns_text = value,
                    _ => {}
                }
                Self::ChangeDns(ChangeDnsDetails {
                    key: r.str("dns_key"),
                    value: dns,
                    source: r.source.clone(),
                    asset: r.destination.clone(),
                    nft_collection: r.asset.clone(),
                })
            }
            K::DeleteDns => Self::DeleteDns(DeleteDnsDetails {
                key: r.str("dns_key"),
                source: r.source.clone(),
                asset: r.destination.clone(),
                nft_collection: r.asset.clone(),
            }),
            K::RenewDns => Self::RenewDns(RenewDnsDetails {
                source: r.source.clone(),
                asset: r.destination.clone(),
                nft_collection: r.asset.clone(),
            }),
            K::DexDepositLiquidity => {
                let dex = r.str("dex");
                // dedust routes deposits through a per-user liquidity contract
                let destination_liquidity = if dex.as_deref() == Some("dedust") {
                    r.destination_secondary.clone()
                } else {
                    r.destination.clone()
                };
                Self::DexDepositLiquidity(DexDepositLiquidityDetails {
                    source: r.source.clone(),
                    dex,
                    pool: r.destination.clone(),
                    destination_liquidity,
                    asset_1: r.str("asset_1"),
                    asset_2: r.str("asset_2"),
                    amount_1: r.str("amount_1"),
                    amount_2: r.str("amount_2"),
                    user_jetton_wallet_1: r.str("user_jetton_wallet_1"),
                    user_jetton_wallet_2: r.str("user_jetton_wallet_2"),
                    lp_tokens_minted: r.str("lp_tokens_minted"),
                    target_asset_1: r.str("target_asset_1"),
                    target_asset_2: r.str("target_asset_2"),
                    target_amount_1: r.str("target_amount_1"),
                    target_amount_2: r.str("target_amount_2"),
                    tick_lower: r.i64("tick_lower"),
                    tick_upper: r.i64("tick_upper"),
                    nft_index: r.u64("nft_index"),
                    nft_address: r.str("nft_address"),
                    vault_excesses: r.typed("vault_excesses").unwrap_or_default(),
                })
            }
            K::DexWithdrawLiquidity => Self::DexWithdrawLiquidity(DexWithdrawLiquidityDetails {
                source: r.source.clone(),
                dex: r.str("dex"),
                pool: r.destination.clone(),
                destination_liquidity: r.destination.clone(),
                asset_1: r.str("asset_1"),
                asset_2: r.str("asset_2"),
                amount_1: r.str("amount_1"),
                amount_2: r.str("amount_2"),
                user_jetton_wallet_1: r.str("user_jetton_wallet_1"),
                user_jetton_wallet_2: r.str("user_jetton_wallet_2"),
                lp_tokens_burnt: r.str("lp_tokens_burnt"),
                burnt_nft_index: r.u64("burnt_nft_index"),
                burnt_nft_address: r.str("burnt_nft_address"),
                tick_lower: r.i64("tick_lower"),
                tick_upper: r.i64("tick_upper"),
            }),
            K::ElectionDeposit => Self::ElectionDeposit(ElectionDetails {
                stake_holder: r.source.clone(),
                amount: r.amount.clone(),
            }),
            K::ElectionRecover => Self::ElectionRecover(ElectionDetails {
                stake_holder: r.source.clone(),
                amount: r.amount.clone(),
            }),
            K::JettonBurn => Self::JettonBurn(JettonBurnDetails {
                owner: r.source.clone(),
                owner_jetton_wallet: r.source_secondary.clone(),
                asset: r.asset.clone(),
                amount: r.amount.clone(),
            }),
            K::JettonSwap => {
                let swap = JettonSwapDetails {
                    dex: r.str("dex"),
                    sender: r.source.clone(),
                    asset_in: r.asset.clone(),
                    asset_out: r.asset2.clone(),
                    dex_incoming_transfer: swap_transfer(r, "in"),
                    dex_outgoing_transfer: swap_transfer(r, "out"),
                    peer_swaps: r.typed("peer_swaps").unwrap_or_default(),
                };
                if swap.dex.as_deref() == Some("tonco") {
                    Self::ToncoJettonSwap(ToncoJettonSwapDetails {
                        min_out_amount: r.str("min_out_amount"),
                        swap,
                    })
                } else {
                    Self::JettonSwap(swap)
                }
            }
            K::JettonTransfer => Self::JettonTransfer(JettonTransferDetails {
                asset: r.asset.clone(),
                sender: r.source.clone(),
                sender_jetton_wallet: r.source_secondary.clone(),
                receiver: r.destination.clone(),
                receiver_jetton_wallet: r.destination_secondary.clone(),
                amount: r.amount.clone(),
                comment: r.str("comment"),
                is_encrypted_comment: r.bool("is_encrypted_comment"),
                query_id: r.u64("query_id"),
                response_destination: r.str("response_destination"),
                custom_payload: r.str("custom_payload"),
                forward_payload: r.str("forward_payload"),
                forward_amount: r.str("forward_amount"),
            }),
            K::JettonMint => Self::JettonMint(JettonMintDetails {
                asset: r.asset.clone(),
                amount: r.amount.clone(),
                ton_amount: r.value,
                receiver: r.destination.clone(),
                receiver_jetton_wallet: r.destination_secondary.clone(),
            }),
            K::NftMint => Self::NftMint(NftMintDetails {
                owner: r.source.clone(),
                nft_collection: r.asset.clone(),
                nft_item: r.asset_secondary.clone(),
                nft_item_index: r.str("nft_item_index"),
            }),
            K::NftTransfer => Self::NftTransfer(NftTransferDetails {
                nft_collection: r.asset.clone(),
                nft_item: r.asset_secondary.clone(),
                nft_item_index: r.str("nft_item_index"),
                old_owner: r.source.clone(),
                new_owner: r.destination.clone(),
                is_purchase: r.bool("is_purchase"),
                price: r.str("price"),
                query_id: r.u64("query_id"),
                response_destination: r.str("response_destination"),
                custom_payload: r.str("custom_payload"),
                forward_payload: r.str("forward_payload"),
                forward_amount: r.str("forward_amount"),
                comment: r.str("comment"),
                is_encrypted_comment: r.bool("is_encrypted_comment"),
                marketplace: r.str("marketplace"),
                real_old_owner: r.str("real_old_owner"),
            }),
            K::NftDiscovery => Self::NftDiscovery(NftDiscoveryDetails {
                source: r.source.clone(),
                nft_item: r.asset_secondary.clone(),
                nft_collection: r.asset.clone(),
                nft_item_index: r.str("nft_item_index"),
            }),
            K::TickTock => Self::TickTock,
            K::StakeDeposit => Self::StakeDeposit(StakeDepositDetails {
                stake_holder: r.source.clone(),
                amount: r.amount.clone(),
                pool: r.destination.clone(),
                provider: r.str("provider"),
                tokens_minted: r.str("tokens_minted"),
                asset: r.asset.clone(),
            }),
            K::StakeWithdrawal => Self::StakeWithdrawal(StakeWithdrawalDetails {
                stake_holder: r.source.clone(),
                amount: r.amount.clone(),
                pool: r.destination.clone(),
                provider: r.str("provider"),
                payout_nft: r.str("payout_nft"),
                tokens_burnt: r.str("tokens_burnt"),
                asset: r.asset.clone(),
            }),
            K::StakeWithdrawalRequest => {
                let provider = r.str("provider");
                // Only tonstakers burns pool tokens on request; elsewhere the
                // amount is not a burnt-token count.
                let tokens_burnt = if provider.as_deref() == Some("tonstakers") {
                    r.amount.clone()
                } else {
                    None
                };
                Self::StakeWithdrawalRequest(StakeWithdrawalRequestDetails {
                    stake_holder: r.source.clone(),
                    pool: r.destination.clone(),
                    provider,
                    payout_nft: r.str("payout_nft"),
                    tokens_burnt,
                    asset: r.asset.clone(),
                })
            }
            K::Subscribe => Self::Subscribe(subscription(r)),
            K::Unsubscribe => Self::Unsubscribe(subscription(r)),
            K::MultisigCreateOrder => Self::MultisigCreateOrder(MultisigCreateOrderDetails {
                query_id: r.u64("query_id"),
                order_seqno: r.str("order_seqno"),
                is_created_by_signer: r.bool("is_created_by_signer"),
                is_signed_by_creator: r.bool("is_signed_by_creator"),
                creator_index: r.u64("creator_index"),
                expiration_date: r.u64("expiration_date"),
                order_boc: r.str("order_boc"),
                source: r.source.clone(),
                destination: r.destination.clone(),
                destination_order: r.destination_secondary.clone(),
            }),
            K::MultisigApprove => Self::MultisigApprove(MultisigApproveDetails {
                signer_index: r.u64("signer_index"),
                exit_code: r.i64("exit_code"),
                source: r.source.clone(),
                destination: r.destination.clone(),
            }),
            K::MultisigExecute => Self::MultisigExecute(MultisigExecuteDetails {
                query_id: r.u64("query_id"),
                order_seqno: r.str("order_seqno"),
                expiration_date: r.u64("expiration_date"),
                approvals_num: r.u64("approvals_num"),
                signers_hash: r.str("signers_hash"),
                order_boc: r.str("order_boc"),
                source: r.source.clone(),
                destination: r.destination.clone(),
            }),
            K::VestingSendMessage => Self::VestingSendMessage(VestingSendMessageDetails {
                query_id: r.u64("query_id"),
                message_boc: r.str("message_boc"),
                source: r.source.clone(),
                vesting: r.destination.clone(),
                destination: r.destination_secondary.clone(),
                amount: r.amount.clone(),
            }),
            K::VestingAddWhitelist => Self::VestingAddWhitelist(VestingAddWhitelistDetails {
                query_id: r.u64("query_id"),
                accounts_added: r.strings("accounts_added"),
                source: r.source.clone(),
                vesting: r.destination.clone(),
            }),
            K::EvaaSupply => Self::EvaaSupply(EvaaSupplyDetails {
                sender_jetton_wallet: r.str("sender_jetton_wallet"),
                recipient_jetton_wallet: r.str("recipient_jetton_wallet"),
                master_jetton_wallet: r.str("master_jetton_wallet"),
                master: r.str("master"),
                asset_id: r.str("asset_id"),
                is_ton: r.bool("is_ton"),
                source: r.source.clone(),
                source_wallet: r.source_secondary.clone(),
                recipient: r.destination.clone(),
                recipient_contract: r.destination_secondary.clone(),
                asset: r.asset.clone(),
                amount: r.amount.clone(),
            }),
            K::EvaaWithdraw => Self::EvaaWithdraw(EvaaWithdrawDetails {
                recipient_jetton_wallet: r.str("recipient_jetton_wallet"),
                master_jetton_wallet: r.str("master_jetton_wallet"),
                master: r.str("master"),
                fail_reason: r.str("fail_reason"),
                asset_id: r.str("asset_id"),
                source: r.source.clone(),
                recipient: r.destination.clone(),
                owner_contract: r.destination_secondary.clone(),
                asset: r.asset.clone(),
                amount: r.amount.clone(),
            }),
            K::EvaaLiquidate => {
                let asset_id = r.str("asset_id");
                let asset = asset_id.as_deref().and_then(|id| assets.resolve_evaa_asset(id));
                Self::EvaaLiquidate(EvaaLiquidateDetails {
                    fail_reason: r.str("fail_reason"),
                    debt_amount: r.str("debt_amount"),
                    source: r.source.clone(),
                    borrower: r.destination.clone(),
                    borrower_contract: r.destination_secondary.clone(),
                    collateral: r.asset.clone(),
                    asset_id,
                    amount: r.amount.clone(),
                    is_known_asset: asset.is_some(),
                    asset,
                })
            }
            K::JvaultClaim => {
                let jettons = r.strings("claimed_jettons");
                let amounts = r.strings("claimed_amounts");
                let claimed_rewards = if jettons.len() == amounts.len() {
                    jettons
                        .into_iter()
                        .zip(amounts)
                        .map(|(jetton, amount)| JettonAmount {
                            jetton: Some(jetton),
                            amount: Some(amount),
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                Self::JvaultClaim(JvaultClaimDetails {
                    claimed_rewards,
                    source: r.source.clone(),
                    stake_wallet: r.source_secondary.clone(),
                    pool: r.destination.clone(),
                })
            }
            K::JvaultStake => Self::JvaultStake(JvaultStakeDetails {
                period: r.u64("period"),
                minted_stake_jettons: r.str("minted_stake_jettons"),
                stake_wallet: r.str("stake_wallet"),
                source: r.source.clone(),
                source_jetton_wallet: r.source_secondary.clone(),
                asset: r.asset.clone(),
                pool: r.destination.clone(),
                amount: r.amount.clone(),
            }),
            K::JvaultUnstake => Self::JvaultUnstake(jvault_unstake(r)),
            K::JvaultUnstakeRequest => Self::JvaultUnstakeRequest(jvault_unstake(r)),
            K::TgbtcMint => Self::TgbtcMint(tgbtc_mint(r)),
            K::TgbtcMintFallback => Self::TgbtcMintFallback(tgbtc_mint(r)),
            K::TgbtcBurn => Self::TgbtcBurn(tgbtc_burn(r)),
            K::TgbtcBurnFallback => Self::TgbtcBurnFallback(tgbtc_burn(r)),
            K::TgbtcNewKey => Self::TgbtcNewKey(tgbtc_new_key(r)),
            K::TgbtcNewKeyFallback => Self::TgbtcNewKeyFallback(tgbtc_new_key(r)),
            K::TgbtcDkgLogFallback => Self::TgbtcDkgLogFallback(TgbtcDkgLogDetails {
                coordinator: r.source.clone(),
                pubkey: r.asset.clone(),
                timestamp: r.value,
            }),
            K::ToncoDeployPool => Self::ToncoDeployPool(ToncoDeployPoolDetails {
                source: r.source.clone(),
                pool: r.destination_secondary.clone(),
                router: r.destination.clone(),
                router_jetton_wallet_1: r.str("router_jetton_wallet_1"),
                router_jetton_wallet_2: r.str("router_jetton_wallet_2"),
                jetton_minter_1: r.str("jetton_minter_1"),
                jetton_minter_2: r.str("jetton_minter_2"),
                tick_spacing: r.i64("tick_spacing"),
                initial_price_x96: r.str("initial_price_x96"),
                protocol_fee: r.u64("protocol_fee"),
                lp_fee_base: r.u64("lp_fee_base"),
                lp_fee_current: r.u64("lp_fee_current"),
                pool_active: r.bool("pool_active"),
            }),
            K::CoffeeCreatePool => Self::CoffeeCreatePool(CoffeeCreatePoolDetails {
                source: r.source.clone(),
                source_jetton_wallet: r.source_secondary.clone(),
                initiator_1: r.str("initiator_1"),
                initiator_2: r.str("initiator_2"),
                provided_asset: r.str("provided_asset"),
                amount: r.amount.clone(),
                pool: r.destination.clone(),
                asset_1: r.asset.clone(),
                asset_2: r.asset2.clone(),
                amount_1: r.str("amount_1"),
                amount_2: r.str("amount_2"),
                lp_tokens_minted: r.str("lp_tokens_minted"),
                pool_creator_contract: r.str("pool_creator_contract"),
            }),
            K::CoffeeCreatePoolCreator => Self::CoffeeCreatePoolCreator(CoffeeCreatePoolCreatorDetails {
                source: r.source.clone(),
                source_jetton_wallet: r.source_secondary.clone(),
                deposit_recipient: r.destination.clone(),
                pool_creator_contract: r.destination_secondary.clone(),
                provided_asset: r.str("provided_asset"),
                asset_1: r.asset.clone(),
                asset_2: r.asset2.clone(),
                amount: r.amount.clone(),
            }),
            K::CoffeeStakingDeposit => Self::CoffeeStakingDeposit(CoffeeStakingDepositDetails {
                source: r.source.clone(),
                source_jetton_wallet: r.source_secondary.clone(),
                pool: r.destination.clone(),
                pool_jetton_wallet: r.destination_secondary.clone(),
                asset: r.asset.clone(),
                amount: r.amount.clone(),
                minted_item_address: r.str("minted_item_address"),
                minted_item_index: r.u64("minted_item_index"),
            }),
            K::CoffeeStakingWithdraw => Self::CoffeeStakingWithdraw(CoffeeStakingWithdrawDetails {
                source: r.source.clone(),
                source_jetton_wallet: r.source_secondary.clone(),
                pool: r.destination.clone(),
                pool_jetton_wallet: r.destination_secondary.clone(),
                asset: r.asset.clone(),
                amount: r.amount.clone(),
                nft_address: r.str("nft_address"),
                nft_index: r.u64("nft_index"),
                points: r.str("points"),
            }),
            K::CoffeeStakingClaimRewards => Self::CoffeeStakingClaimRewards(CoffeeStakingClaimRewardsDetails {
                pool: r.source.clone(),
                pool_jetton_wallet: r.source_secondary.clone(),
                recipient: r.destination.clone(),
                recipient_jetton_wallet: r.destination_secondary.clone(),
                asset: r.asset.clone(),
                amount: r.amount.clone(),
            }),
            K::CoffeeMevProtectHoldFunds => Self::CoffeeMevProtectHoldFunds(CoffeeMevProtectHoldFundsDetails {
                source: r.source.clone(),
                source_jetton_wallet: r.source_secondary.clone(),
                mev_contract: r.destination.clone(),
                mev_contract_jetton_wallet: r.destination_secondary.clone(),
                asset: r.asset.clone(),
                amount: r.amount.clone(),
            }),
            K::CoffeeCreateVault => Self::CoffeeCreateVault(CoffeeCreateVaultDetails {
                source: r.source.clone(),
                vault: r.destination.clone(),
                asset: r.asset.clone(),
                value: r.value,
            }),
            K::Unknown => Self::Unknown(UnknownDetails {
                error: r
                    .str("error")
                    .unwrap_or_else(|| "unrecognized transaction shape".to_string()),
                raw: r.clone(),
            }),
        }
    }

    /// The type tag consumers see for this payload.
    pub fn kind(&self) -> ActionKind {
        use ActionKind as K;
        match self {
            Self::CallContract(_) => K::CallContract,
            Self::ContractDeploy(_) => K::ContractDeploy,
            Self::TonTransfer(_) => K::TonTransfer,
            Self::ExtraCurrencyTransfer(_) => K::ExtraCurrencyTransfer,
            Self::AuctionBid(_) => K::AuctionBid,
            Self::ChangeDns(_) => K::ChangeDns,
            Self::DeleteDns(_) => K::DeleteDns,
            Self::RenewDns(_) => K::RenewDns,
            Self::DexDepositLiquidity(_) => K::DexDepositLiquidity,
            Self::DexWithdrawLiquidity(_) => K::DexWithdrawLiquidity,
            Self::ElectionDeposit(_) => K::ElectionDeposit,
            Self::ElectionRecover(_) => K::ElectionRecover,
            Self::JettonBurn(_) => K::JettonBurn,
            Self::JettonSwap(_) | Self::ToncoJettonSwap(_) => K::JettonSwap,
            Self::JettonTransfer(_) => K::JettonTransfer,
            Self::JettonMint(_) => K::JettonMint,
            Self::NftMint(_) => K::NftMint,
            Self::NftTransfer(_) => K::NftTransfer,
            Self::NftDiscovery(_) => K::NftDiscovery,
            Self::TickTock => K::TickTock,
            Self::StakeDeposit(_) => K::StakeDeposit,
            Self::StakeWithdrawal(_) => K::StakeWithdrawal,
            Self::StakeWithdrawalRequest(_) => K::StakeWithdrawalRequest,
            Self::Subscribe(_) => K::Subscribe,
            Self::Unsubscribe(_) => K::Unsubscribe,
            Self::MultisigCreateOrder(_) => K::MultisigCreateOrder,
            Self::MultisigApprove(_) => K::MultisigApprove,
            Self::MultisigExecute(_) => K::MultisigExecute,
            Self::VestingSendMessage(_) => K::VestingSendMessage,
            Self::VestingAddWhitelist(_) => K::VestingAddWhitelist,
            Self::EvaaSupply(_) => K::EvaaSupply,
            Self::EvaaWithdraw(_) => K::EvaaWithdraw,
            Self::EvaaLiquidate(_) => K::EvaaLiquidate,
            Self::JvaultClaim(_) => K::JvaultClaim,
            Self::JvaultStake(_) => K::JvaultStake,
            Self::JvaultUnstake(_) => K::JvaultUnstake,
            Self::JvaultUnstakeRequest(_) => K::JvaultUnstakeRequest,
            Self::TgbtcMint(_) => K::TgbtcMint,
            Self::TgbtcMintFallback(_) => K::TgbtcMintFallback,
            Self::TgbtcBurn(_) => K::TgbtcBurn,
            Self::TgbtcBurnFallback(_) => K::TgbtcBurnFallback,
            Self::TgbtcNewKey(_) => K::TgbtcNewKey,
            Self::TgbtcNewKeyFallback(_) => K::TgbtcNewKeyFallback,
            Self::TgbtcDkgLogFallback(_) => K::TgbtcDkgLogFallback,
            Self::ToncoDeployPool(_) => K::ToncoDeployPool,
            Self::CoffeeCreatePool(_) => K::CoffeeCreatePool,
            Self::CoffeeCreatePoolCreator(_) => K::CoffeeCreatePoolCreator,
            Self::CoffeeStakingDeposit(_) => K::CoffeeStakingDeposit,
            Self::CoffeeStakingWithdraw(_) => K::CoffeeStakingWithdraw,
            Self::CoffeeStakingClaimRewards(_) => K::CoffeeStakingClaimRewards,
            Self::CoffeeMevProtectHoldFunds(_) => K::CoffeeMevProtectHoldFunds,
            Self::CoffeeCreateVault(_) => K::CoffeeCreateVault,
            Self::Unknown(_) => K::Unknown,
        }
    }
}

fn ton_transfer(r: &RawActionFields) -> TonTransferDetails {
    TonTransferDetails {
        source: r.source.clone(),
        destination: r.destination.clone(),
        value: r.value,
        comment: r.str("comment"),
        encrypted: r.bool("encrypted").unwrap_or(false),
        extra_currencies: r.extra_currencies.clone(),
    }
}

fn subscription(r: &RawActionFields) -> SubscriptionDetails {
    SubscriptionDetails {
        subscriber: r.source.clone(),
        beneficiary: r.destination.clone(),
        subscription: r.destination_secondary.clone(),
        amount: r.amount.clone(),
    }
}

fn jvault_unstake(r: &RawActionFields) -> JvaultUnstakeDetails {
    JvaultUnstakeDetails {
        source: r.source.clone(),
        stake_wallet: r.source_secondary.clone(),
        pool: r.destination.clone(),
        amount: r.amount.clone(),
        exit_code: r.i64("exit_code"),
        asset: r.asset.clone(),
        staking_asset: r.asset2.clone(),
    }
}

fn tgbtc_mint(r: &RawActionFields) -> TgbtcMintDetails {
    TgbtcMintDetails {
        source: r.source.clone(),
        destination: r.destination.clone(),
        destination_wallet: r.destination_secondary.clone(),
        amount: r.amount.clone(),
        asset: r.asset.clone(),
        bitcoin_txid: r.asset_secondary.clone(),
    }
}

fn tgbtc_burn(r: &RawActionFields) -> TgbtcBurnDetails {
    TgbtcBurnDetails {
        source: r.source.clone(),
        source_wallet: r.source_secondary.clone(),
        destination: r.destination.clone(),
        amount: r.amount.clone(),
        asset: r.asset.clone(),
    }
}

fn tgbtc_new_key(r: &RawActionFields) -> TgbtcNewKeyDetails {
    TgbtcNewKeyDetails {
        source: r.source.clone(),
        pubkey: r.source_secondary.clone(),
        coordinator: r.destination.clone(),
        pegout: r.destination_secondary.clone(),
        amount: r.amount.clone(),
        asset: r.asset.clone(),
    }
}

// ─── Action ──────────────────────────────────────────────────────────────────

/// A classified operation within a trace, identified by (trace id, position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub trace_id: String,
    /// Position within the trace, in causal order.
    pub action_id: u32,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub details: ActionDetails,
    pub tx_hashes: Vec<String>,
    pub accounts: Vec<Address>,
    pub start_lt: u64,
    pub end_lt: u64,
    pub start_utime: u32,
    pub end_utime: u32,
    pub success: bool,
    pub trace_end_lt: u64,
    pub trace_end_utime: u32,
    pub trace_mc_seqno_end: u32,
    pub trace_external_hash: Option<String>,
}
