//! NFT items (TEP-62) and TON DNS records, which are NFT items too.

use tonindex_core::action::{ActionKind, RawActionFields};

use super::{decoded_str, ActionRule, MatchContext, RuleMatch};
use crate::registry::opcodes;

const NFT_TRANSFER_FIELDS: &[&str] = &[
    "query_id",
    "response_destination",
    "custom_payload",
    "forward_payload",
    "forward_amount",
    "comment",
    "is_encrypted_comment",
];

/// `change_dns_record` on a domain item. No value means delete, except for
/// the all-zero key which is how owners renew a domain.
pub struct DnsRule;

impl ActionRule for DnsRule {
    fn name(&self) -> &str {
        "dns"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        if ctx.graph.opcode(anchor) != Some(opcodes::DNS_CHANGE_RECORD) {
            return None;
        }
        let msg = ctx.graph.in_msg(anchor)?;
        let mut raw = RawActionFields {
            source: msg.source.clone(),
            destination: Some(ctx.graph.account(anchor).to_string()),
            asset: msg.field_str("nft_collection"),
            ..RawActionFields::default()
        };
        for key in ["dns_key", "dns_value_schema", "dns_value", "dns_flags"] {
            raw.copy_from(&msg.decoded, key);
        }

        let has_value = raw.fields.get("dns_value").is_some_and(|v| !v.is_null());
        let kind = if has_value {
            ActionKind::ChangeDns
        } else if is_renew_key(raw.str("dns_key").as_deref()) {
            ActionKind::RenewDns
        } else {
            ActionKind::DeleteDns
        };
        let lead = ctx.initiator(anchor);
        Some(RuleMatch::new(kind, anchor, raw).with_nodes(lead.into_iter().chain(ctx.free_descendants(anchor))))
    }
}

fn is_renew_key(key: Option<&str>) -> bool {
    match key {
        None => true,
        Some(k) => k.is_empty() || k.trim_start_matches("0x").chars().all(|c| c == '0'),
    }
}

/// NFT `transfer`, including sales where a marketplace contract hands the
/// item to the buyer.
pub struct NftTransferRule;

impl ActionRule for NftTransferRule {
    fn name(&self) -> &str {
        "nft_transfer"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        if ctx.graph.opcode(anchor) != Some(opcodes::NFT_TRANSFER) {
            return None;
        }
        let msg = ctx.graph.in_msg(anchor)?;
        let mut raw = RawActionFields {
            source: msg.source.clone(),
            destination: msg.field_str("new_owner"),
            asset: msg.field_str("nft_collection"),
            asset_secondary: Some(ctx.graph.account(anchor).to_string()),
            ..RawActionFields::default()
        };
        raw.copy_from(&msg.decoded, "nft_item_index");
        for key in NFT_TRANSFER_FIELDS {
            raw.copy_from(&msg.decoded, key);
        }

        let mut nodes: Vec<usize> = ctx.initiator(anchor).into_iter().collect();
        if let Some((sale, marketplace)) = sale_contract(ctx, anchor) {
            raw.set("is_purchase", true);
            raw.set("marketplace", marketplace);
            let sale_msg = ctx.graph.in_msg(sale);
            let price = sale_msg
                .and_then(|m| m.field_str("price"))
                .or_else(|| sale_msg.and_then(|m| m.value).map(|v| v.to_string()));
            if let Some(price) = price {
                raw.set("price", price);
            }
            if let Some(seller) = decoded_str(ctx, sale, "seller") {
                raw.set("real_old_owner", seller);
            }
            if raw.destination.is_none() {
                raw.destination = ctx.sender(sale);
            }
            nodes.push(sale);
            nodes.extend(ctx.free_descendants(sale));
            nodes.extend(ctx.initiator(sale));
        } else {
            raw.set("is_purchase", false);
            nodes.extend(ctx.free_descendants(anchor));
        }
        Some(RuleMatch::new(ActionKind::NftTransfer, anchor, raw).with_nodes(nodes))
    }
}

/// The free parent of `anchor` if it paid a registered marketplace fee.
fn sale_contract<'r>(ctx: &MatchContext<'r>, anchor: usize) -> Option<(usize, &'r str)> {
    let sale = ctx.graph.parent(anchor).filter(|&p| ctx.is_free(p))?;
    if ctx.graph.is_external_root(sale) {
        return None;
    }
    ctx.graph
        .tx(sale)
        .internal_out()
        .filter_map(|m| m.destination.as_deref())
        .find_map(|dst| ctx.registry.marketplace_for(dst))
        .map(|m| (sale, m.name.as_str()))
}

/// `get_static_data` answered by `report_static_data`.
pub struct NftDiscoveryRule;

impl ActionRule for NftDiscoveryRule {
    fn name(&self) -> &str {
        "nft_discovery"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        if ctx.graph.opcode(anchor) != Some(opcodes::NFT_GET_STATIC_DATA) {
            return None;
        }
        let report = ctx.free_child(anchor, opcodes::NFT_REPORT_STATIC_DATA)?;
        let mut raw = RawActionFields {
            source: ctx.sender(anchor),
            asset_secondary: Some(ctx.graph.account(anchor).to_string()),
            asset: decoded_str(ctx, report, "collection"),
            ..RawActionFields::default()
        };
        if let Some(index) = decoded_str(ctx, report, "index") {
            raw.set("nft_item_index", index);
        }
        let lead = ctx.initiator(anchor);
        Some(RuleMatch::new(ActionKind::NftDiscovery, anchor, raw).with_nodes(lead.into_iter().chain([report])))
    }
}

/// A collection deploying an item: a state-init message carrying the item
/// index.
pub struct NftMintRule;

impl ActionRule for NftMintRule {
    fn name(&self) -> &str {
        "nft_mint"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let msg = ctx.graph.in_msg(anchor)?;
        msg.init_state.as_ref()?;
        let index = msg.field_str("nft_item_index")?;
        let mut raw = RawActionFields {
            source: msg.field_str("owner"),
            asset: msg.source.clone(),
            asset_secondary: Some(ctx.graph.account(anchor).to_string()),
            ..RawActionFields::default()
        };
        raw.set("nft_item_index", index);

        let mut nodes = ctx.free_descendants(anchor);
        if let Some(collection) = ctx.graph.parent(anchor).filter(|&p| ctx.is_free(p)) {
            nodes.push(collection);
            nodes.extend(ctx.initiator(collection));
        }
        Some(RuleMatch::new(ActionKind::NftMint, anchor, raw).with_nodes(nodes))
    }
}
