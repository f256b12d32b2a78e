//! Protocol registry — read-only lookup tables for classification.
//!
//! Loaded once at startup (built-in mainnet defaults or a JSON file) and
//! shared as `Arc<ProtocolRegistry>`. Nothing mutates it afterwards.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tonindex_core::action::{ActionKind, AssetResolver};
use tonindex_core::types::Address;
use tonindex_core::ConfigError;

pub mod opcodes {
    pub const JETTON_TRANSFER: u32 = 0x0f8a7ea5;
    pub const JETTON_INTERNAL_TRANSFER: u32 = 0x178d4519;
    pub const JETTON_NOTIFY: u32 = 0x7362d09c;
    pub const EXCESSES: u32 = 0xd53276db;
    pub const JETTON_BURN: u32 = 0x595f07bc;
    pub const JETTON_BURN_NOTIFICATION: u32 = 0x7bdd97de;
    pub const NFT_TRANSFER: u32 = 0x5fcc3d14;
    pub const NFT_OWNERSHIP_ASSIGNED: u32 = 0x05138d91;
    pub const NFT_GET_STATIC_DATA: u32 = 0x2fcb26a2;
    pub const NFT_REPORT_STATIC_DATA: u32 = 0x8b771735;
    pub const DNS_CHANGE_RECORD: u32 = 0x4eb1f0f9;
    pub const ELECTOR_NEW_STAKE: u32 = 0x4e73744b;
    pub const ELECTOR_NEW_STAKE_CONFIRMATION: u32 = 0xf374484c;
    pub const ELECTOR_RECOVER_STAKE: u32 = 0x47657424;
    pub const ELECTOR_RECOVER_STAKE_RESPONSE: u32 = 0xf96f7324;
    pub const TEXT_COMMENT: u32 = 0x0000_0000;
    pub const ENCRYPTED_COMMENT: u32 = 0x2167da4b;
}

/// A DEX and the opcodes its contracts accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DexDefinition {
    /// Name reported in action details (`stonfi`, `dedust`, `tonco`, ...).
    pub name: String,
    /// Routers and vaults that receive swap requests.
    pub routers: Vec<Address>,
    /// Opcodes of a swap request as seen by a router.
    pub swap_opcodes: Vec<u32>,
    /// Opcodes of pool-level swaps (one per hop of a multi-hop swap).
    #[serde(default)]
    pub pool_swap_opcodes: Vec<u32>,
    /// Opcodes the router uses to pay the swap result out.
    #[serde(default)]
    pub payout_opcodes: Vec<u32>,
    #[serde(default)]
    pub deposit_opcodes: Vec<u32>,
    #[serde(default)]
    pub withdraw_opcodes: Vec<u32>,
}

/// A liquid-staking or nominator pool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingProvider {
    /// Provider tag reported in action details (`tonstakers`, `nominators`, ...).
    pub provider: String,
    pub pools: Vec<Address>,
    /// Pool jetton master, if the provider mints one.
    #[serde(default)]
    pub asset: Option<Address>,
    #[serde(default)]
    pub deposit_opcodes: Vec<u32>,
    /// Text comments that mean "deposit" (simple-message pools).
    #[serde(default)]
    pub deposit_comments: Vec<String>,
    /// Opcodes that start a withdrawal, as seen by the pool.
    #[serde(default)]
    pub withdraw_opcodes: Vec<u32>,
    #[serde(default)]
    pub withdraw_comments: Vec<String>,
}

/// An NFT marketplace identified by the address it collects fees on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marketplace {
    pub name: String,
    pub fee_addresses: Vec<Address>,
}

/// A data-driven rule: a message with `opcode` (to one of `accounts`, if
/// given) yields one action of `kind` covering the receiving transaction,
/// its initiator and its descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcodeRule {
    pub name: String,
    pub opcode: u32,
    pub kind: ActionKind,
    #[serde(default)]
    pub accounts: Vec<Address>,
    /// Fixed asset reported for matches of this rule.
    #[serde(default)]
    pub asset: Option<Address>,
}

impl OpcodeRule {
    pub fn applies_to(&self, account: &str) -> bool {
        self.accounts.is_empty() || self.accounts.iter().any(|a| a == account)
    }
}

/// Missing fields in a JSON registry are empty, not the mainnet tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default = "ProtocolRegistry::empty")]
pub struct ProtocolRegistry {
    pub elector: Option<Address>,
    pub dexes: Vec<DexDefinition>,
    pub staking: Vec<StakingProvider>,
    pub marketplaces: Vec<Marketplace>,
    /// EVAA asset id (decimal) → canonical asset address.
    pub evaa_assets: HashMap<String, Address>,
    /// Opcodes classified as `call_contract` when nothing more specific matches.
    pub known_call_opcodes: Vec<u32>,
    pub opcode_rules: Vec<OpcodeRule>,
}

const TON_ASSET: &str = "0:0000000000000000000000000000000000000000000000000000000000000000";
const EVAA_MASTER: &str = "0:bcad466a47fa565750729565253cd073ca24d856804499090c2100d95c809f9e";

fn rule(name: &str, opcode: u32, kind: ActionKind, accounts: &[&str]) -> OpcodeRule {
    OpcodeRule {
        name: name.into(),
        opcode,
        kind,
        accounts: accounts.iter().map(|a| a.to_string()).collect(),
        asset: None,
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ProtocolRegistry {
    /// An empty registry: only the generic rule families apply.
    pub fn empty() -> Self {
        Self {
            elector: None,
            dexes: Vec::new(),
            staking: Vec::new(),
            marketplaces: Vec::new(),
            evaa_assets: HashMap::new(),
            known_call_opcodes: Vec::new(),
            opcode_rules: Vec::new(),
        }
    }

    /// Built-in mainnet tables.
    pub fn mainnet() -> Self {
        let evaa_assets = [
            (
                "11876925370864614464799087627157805050745321306404563164673853337929163193738",
                TON_ASSET,
            ),
            (
                "91621667903763073563570557639433445791506232618002614896981036659302854767224",
                "0:b113a994b5024a16719f69139328eb759596c38a25f59028b146fecdc3621dfe",
            ),
            (
                "23103091784861387372100043848078515239542568751939923972799733728526040769767",
                "0:bdf3fa8098d129b54b4f73b5bac5d1e1fd91eb054169c3916dfc8ccd536d1000",
            ),
        ]
        .into_iter()
        .map(|(id, addr)| (id.to_string(), addr.to_string()))
        .collect();

        Self {
            elector: Some("-1:3333333333333333333333333333333333333333333333333333333333333333".into()),
            dexes: vec![
                DexDefinition {
                    name: "stonfi".into(),
                    routers: vec!["0:779dcc815138d9500e449c5291e7f12738c23d575b5310000f6a253bd607384e".into()],
                    swap_opcodes: vec![0x25938561],
                    pool_swap_opcodes: vec![],
                    payout_opcodes: vec![0xf93bb43f],
                    deposit_opcodes: vec![0xfcf9e58f],
                    withdraw_opcodes: vec![],
                },
                DexDefinition {
                    name: "dedust".into(),
                    routers: vec!["0:dae153a74d894bbc32748198cd626e4f5df4a69ad2fa56ce80fc2644b5708d20".into()],
                    swap_opcodes: vec![0xea06185d, 0xe3a0d482],
                    pool_swap_opcodes: vec![0x72aca8aa],
                    payout_opcodes: vec![0x474f86cf],
                    deposit_opcodes: vec![0xd55e4686],
                    withdraw_opcodes: vec![],
                },
                DexDefinition {
                    name: "tonco".into(),
                    routers: vec!["0:bffadd270a738531da7b13ba8fc403826c2586173f9ede9c316fab53bc59ac86".into()],
                    swap_opcodes: vec![0xa7fb58f8],
                    pool_swap_opcodes: vec![],
                    payout_opcodes: vec![],
                    deposit_opcodes: vec![],
                    withdraw_opcodes: vec![],
                },
            ],
            staking: vec![
                StakingProvider {
                    provider: "tonstakers".into(),
                    pools: vec!["0:a45b17f28409229b78360e3290420f13e4fe20f90d7e2bf8c4ac6703259e22fa".into()],
                    asset: Some("0:bdf3fa8098d129b54b4f73b5bac5d1e1fd91eb054169c3916dfc8ccd536d1000".into()),
                    deposit_opcodes: vec![0x47d54391],
                    deposit_comments: vec![],
                    withdraw_opcodes: vec![opcodes::JETTON_BURN_NOTIFICATION],
                    withdraw_comments: vec![],
                },
            ],
            marketplaces: vec![Marketplace {
                name: "getgems".into(),
                fee_addresses: vec!["0:584ee61b2dff0837116d0fcb5078d93964bcbe9c05fd6a141b1bfca5d6a43e18".into()],
            }],
            evaa_assets,
            known_call_opcodes: vec![opcodes::EXCESSES],
            opcode_rules: vec![
                rule("subscription_payment", 0x706c7567, ActionKind::Subscribe, &[]),
                rule("subscription_destruct", 0x64737472, ActionKind::Unsubscribe, &[]),
                rule("multisig_new_order", 0xf718510f, ActionKind::MultisigCreateOrder, &[]),
                rule("multisig_approve", 0xa762230f, ActionKind::MultisigApprove, &[]),
                rule("multisig_execute", 0x75097f5d, ActionKind::MultisigExecute, &[]),
                rule("vesting_send_message", 0xa7733acd, ActionKind::VestingSendMessage, &[]),
                rule("vesting_add_whitelist", 0x7258a69b, ActionKind::VestingAddWhitelist, &[]),
                rule("evaa_supply", 0x1, ActionKind::EvaaSupply, &[EVAA_MASTER]),
                rule("evaa_withdraw", 0x2, ActionKind::EvaaWithdraw, &[EVAA_MASTER]),
                rule("evaa_liquidate", 0x3, ActionKind::EvaaLiquidate, &[EVAA_MASTER]),
            ],
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn is_elector(&self, account: &str) -> bool {
        self.elector.as_deref() == Some(account)
    }

    /// The DEX whose router is `account`.
    pub fn dex_at(&self, account: &str) -> Option<&DexDefinition> {
        self.dexes.iter().find(|d| d.routers.iter().any(|r| r == account))
    }

    pub fn staking_at(&self, account: &str) -> Option<&StakingProvider> {
        self.staking.iter().find(|p| p.pools.iter().any(|a| a == account))
    }

    pub fn marketplace_for(&self, address: &str) -> Option<&Marketplace> {
        self.marketplaces
            .iter()
            .find(|m| m.fee_addresses.iter().any(|a| a == address))
    }

    pub fn is_known_call_opcode(&self, opcode: u32) -> bool {
        self.known_call_opcodes.contains(&opcode)
    }
}

impl AssetResolver for ProtocolRegistry {
    fn resolve_evaa_asset(&self, asset_id: &str) -> Option<Address> {
        self.evaa_assets.get(asset_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_lookups() {
        let reg = ProtocolRegistry::mainnet();
        assert!(reg.is_elector("-1:3333333333333333333333333333333333333333333333333333333333333333"));
        assert_eq!(
            reg.dex_at("0:779dcc815138d9500e449c5291e7f12738c23d575b5310000f6a253bd607384e")
                .map(|d| d.name.as_str()),
            Some("stonfi")
        );
        assert_eq!(
            reg.resolve_evaa_asset("11876925370864614464799087627157805050745321306404563164673853337929163193738")
                .as_deref(),
            Some(TON_ASSET)
        );
        assert!(reg.resolve_evaa_asset("1").is_none());
        assert_eq!(
            reg.staking_at("0:a45b17f28409229b78360e3290420f13e4fe20f90d7e2bf8c4ac6703259e22fa")
                .map(|p| p.provider.as_str()),
            Some("tonstakers")
        );
    }

    #[test]
    fn loads_from_json() {
        let reg = ProtocolRegistry::from_json_str(
            r#"{
                "elector": "-1:ee",
                "opcode_rules": [
                    {"name": "jvault_stake", "opcode": 3735928559, "kind": "jvault_stake", "accounts": ["0:pool"]}
                ]
            }"#,
        )
        .unwrap();
        assert!(reg.is_elector("-1:ee"));
        assert!(reg.dexes.is_empty());
        let rule = &reg.opcode_rules[0];
        assert_eq!(rule.kind, ActionKind::JvaultStake);
        assert!(rule.applies_to("0:pool"));
        assert!(!rule.applies_to("0:other"));
    }

    #[test]
    fn bad_json_is_a_config_error() {
        assert!(matches!(
            ProtocolRegistry::from_json_str("[1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}
