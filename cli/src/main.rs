//! tonindex CLI — inspect indexer configurations and the action vocabulary.
//!
//! Usage:
//! ```bash
//! tonindex info
//! tonindex vocabulary [--json]
//! tonindex check-config indexer.json
//! tonindex check-registry protocols.json
//! ```

use std::env;
use std::process;

use anyhow::{bail, Context, Result};
use tonindex_classify::ProtocolRegistry;
use tonindex_core::action::{ActionKind, ACTION_VOCABULARY_VERSION};
use tonindex_core::indexer::IndexerConfig;
use tonindex_pipeline::observability::directives;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "vocabulary" => cmd_vocabulary(args.get(2).map(String::as_str) == Some("--json")),
        "check-config" => cmd_check_config(args.get(2)),
        "check-registry" => cmd_check_registry(args.get(2)),
        "version" | "--version" | "-V" => {
            println!("tonindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("tonindex {}", env!("CARGO_PKG_VERSION"));
    println!("Sharded-chain indexer core: traces, actions, ordered commits\n");
    println!("USAGE:");
    println!("    tonindex <COMMAND> [ARGS]\n");
    println!("COMMANDS:");
    println!("    info                   Show default indexer settings");
    println!("    vocabulary [--json]    List action type tags");
    println!("    check-config <PATH>    Validate an indexer config file");
    println!("    check-registry <PATH>  Validate a protocol registry file");
    println!("    version                Print version");
    println!("    help                   Print this help");
}

fn cmd_info() {
    let cfg = IndexerConfig::default();
    let registry = ProtocolRegistry::mainnet();
    println!("TonIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Action vocabulary: v{ACTION_VOCABULARY_VERSION} ({} kinds)", ActionKind::ALL.len());
    println!("  Trace TTL: {} masterchain seqnos", cfg.trace_ttl_mc_seqnos);
    println!("  Max pending traces: {}", cfg.max_pending_traces);
    println!("  Batch size: {} blocks / {} ms window", cfg.batch_max_blocks, cfg.batch_window_ms);
    println!(
        "  Commit retries: {} (backoff {}..{} ms)",
        cfg.retry.max_retries, cfg.retry.initial_backoff_ms, cfg.retry.max_backoff_ms
    );
    println!("  Replay depth on restart: {} blocks", cfg.replay_depth);
    println!(
        "  Built-in registry: {} DEXes, {} staking providers, {} marketplaces",
        registry.dexes.len(),
        registry.staking.len(),
        registry.marketplaces.len()
    );
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

fn cmd_vocabulary(json: bool) -> Result<()> {
    if json {
        let doc = serde_json::json!({
            "version": ACTION_VOCABULARY_VERSION,
            "kinds": ActionKind::ALL,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }
    println!("action vocabulary v{ACTION_VOCABULARY_VERSION}");
    for kind in ActionKind::ALL {
        println!("  {kind}");
    }
    Ok(())
}

fn cmd_check_config(path: Option<&String>) -> Result<()> {
    let Some(path) = path else {
        bail!("check-config requires a path");
    };
    let cfg = IndexerConfig::from_json_file(path)
        .with_context(|| format!("invalid indexer config {path}"))?;
    println!("{path}: ok");
    println!("  id: {}", cfg.id);
    for cursor in &cfg.start {
        println!("  start: {} @ {}", cursor.shard, cursor.seqno);
    }
    match cfg.stop_at_mc_seqno {
        Some(stop) => println!("  stop at masterchain seqno: {stop}"),
        None => println!("  stop at masterchain seqno: never (live)"),
    }
    println!("  log filter: {}", directives(&cfg.log));
    Ok(())
}

fn cmd_check_registry(path: Option<&String>) -> Result<()> {
    let Some(path) = path else {
        bail!("check-registry requires a path");
    };
    let registry = ProtocolRegistry::from_json_file(path)
        .with_context(|| format!("invalid protocol registry {path}"))?;
    println!("{path}: ok");
    println!("  dexes: {}", registry.dexes.len());
    println!("  staking providers: {}", registry.staking.len());
    println!("  marketplaces: {}", registry.marketplaces.len());
    println!("  opcode rules: {}", registry.opcode_rules.len());
    Ok(())
}
