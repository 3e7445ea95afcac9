// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Control Plane CLI handlers. Grounded on
// `zerotier-system-service/src/main.rs`'s dispatch shape (one function per
// subcommand, a shared `Flags` struct for `-j`/`-p`, JSON via
// `serde_json`); unlike the teacher's long-lived daemon reached over a
// local API this workspace does not specify a wire format for (§6: "no
// wire format specified here"), each invocation here opens the data
// directory, performs one operation against a freshly constructed
// `Adapter`, persists anything that changed, and exits — a one-shot local
// control tool rather than a client of a background service.

use std::sync::Arc;

use clap::ArgMatches;
use serde_json::json;

use lqsr_core::{Adapter, AdapterId};
use lqsr_util::MacAddr;

use crate::datadir::DataDir;
use crate::localconfig::{InterfaceOverride, LocalConfig, MetricKind};
use crate::log::Log;

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 64;
pub const EXIT_IOERR: i32 = 74;

pub struct Flags {
    pub json_output: bool,
    pub base_path: String,
}

fn print_result(flags: &Flags, value: serde_json::Value, human: impl FnOnce() -> String) {
    if flags.json_output {
        println!("{}", value);
    } else {
        println!("{}", human());
    }
}

fn open_data_dir(flags: &Flags) -> std::io::Result<DataDir> {
    DataDir::open(&flags.base_path)
}

fn build_adapter(cfg: &LocalConfig) -> lqsr_core::error::Result<Arc<Adapter>> {
    let log = Arc::new(Log::new(Option::<&std::path::Path>::None, 0, true, cfg.log.debug).unwrap());
    let link_layer = Arc::new(crate::service::LoggingLinkLayer::new(MacAddr::new(cfg.node_address), log.clone()));
    let host = Arc::new(crate::service::LoggingHost::new(log));
    let random = Arc::new(crate::service::OsRandomSource);
    let adapter_config = cfg.to_adapter_config()?;
    Ok(Arc::new(Adapter::new(AdapterId(0), adapter_config, link_layer, host, random)?))
}

pub fn cmd_status(flags: &Flags) -> i32 {
    match open_data_dir(flags) {
        Ok(dd) => {
            let cfg = dd.config();
            print_result(
                flags,
                json!({"nodeAddress": MacAddr::new(cfg.node_address).to_string(), "metric": format!("{:?}", cfg.metric), "cryptoEnabled": cfg.crypto.enabled}),
                || format!("node {} metric {:?} crypto {}", MacAddr::new(cfg.node_address), cfg.metric, cfg.crypto.enabled),
            );
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_config_show(flags: &Flags) -> i32 {
    match open_data_dir(flags) {
        Ok(dd) => {
            let cfg = dd.config();
            print_result(flags, serde_json::to_value(&cfg).unwrap_or(json!({})), || cfg.to_toml_string().unwrap_or_default());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_config_set_metric(flags: &Flags, metric: &str) -> i32 {
    let kind = match metric {
        "hop" => MetricKind::Hop,
        "rtt" => MetricKind::Rtt,
        "pktpair" => MetricKind::PktPair,
        "etx" => MetricKind::Etx,
        "wcett" => MetricKind::Wcett,
        _ => {
            eprintln!("unknown metric type '{}'. Use one of: hop rtt pktpair etx wcett", metric);
            return EXIT_USAGE;
        }
    };
    match open_data_dir(flags) {
        Ok(dd) => {
            let mut cfg = dd.config();
            cfg.metric = kind;
            match dd.save_config(cfg) {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    eprintln!("error saving config: {}", e);
                    EXIT_IOERR
                }
            }
        }
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_config_set_crypto(flags: &Flags, enabled: bool) -> i32 {
    match open_data_dir(flags) {
        Ok(dd) => {
            let mut cfg = dd.config();
            cfg.crypto.enabled = enabled;
            match dd.save_config(cfg) {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    eprintln!("error saving config: {}", e);
                    EXIT_IOERR
                }
            }
        }
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_config_set_damping(flags: &Flags, factor: u32) -> i32 {
    match open_data_dir(flags) {
        Ok(dd) => {
            let mut cfg = dd.config();
            cfg.route_flap_damping = factor;
            match dd.save_config(cfg) {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    eprintln!("error saving config: {}", e);
                    EXIT_IOERR
                }
            }
        }
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_iface_set(flags: &Flags, if_index: u8, receive_only: bool, channel: u8, bandwidth_bps: u64) -> i32 {
    match open_data_dir(flags) {
        Ok(dd) => {
            let mut cfg = dd.config();
            cfg.interfaces.insert(if_index, InterfaceOverride { receive_only, channel, bandwidth_bps });
            match dd.save_config(cfg) {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    eprintln!("error saving config: {}", e);
                    EXIT_IOERR
                }
            }
        }
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_iface_list(flags: &Flags) -> i32 {
    match open_data_dir(flags) {
        Ok(dd) => {
            let cfg = dd.config();
            print_result(flags, serde_json::to_value(&cfg.interfaces).unwrap_or(json!({})), || format!("{:#?}", cfg.interfaces));
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_cache_addlink(flags: &Flags, from: MacAddr, to: MacAddr, in_if: u8, out_if: u8, metric: u32) -> i32 {
    let dd = match open_data_dir(flags) {
        Ok(dd) => dd,
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            return EXIT_IOERR;
        }
    };
    match build_adapter(&dd.config()) {
        Ok(adapter) => {
            adapter.link_cache().add_link(from, to, in_if, out_if, metric, 0, 0);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error constructing adapter: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_route_query(flags: &Flags, dest: MacAddr) -> i32 {
    let dd = match open_data_dir(flags) {
        Ok(dd) => dd,
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            return EXIT_IOERR;
        }
    };
    match build_adapter(&dd.config()) {
        Ok(adapter) => {
            let route = adapter.link_cache().fill_source_route(dest);
            match route {
                Some(hops) => {
                    let addrs: Vec<String> = hops.iter().map(|h| h.addr.to_string()).collect();
                    print_result(flags, json!({"hops": addrs}), || addrs.join(" -> "));
                }
                None => {
                    print_result(flags, json!({"hops": []}), || "no route".to_string());
                }
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error constructing adapter: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_stats_reset(flags: &Flags) -> i32 {
    let dd = match open_data_dir(flags) {
        Ok(dd) => dd,
        Err(e) => {
            eprintln!("error opening data directory: {}", e);
            return EXIT_IOERR;
        }
    };
    match build_adapter(&dd.config()) {
        Ok(_adapter) => {
            // A freshly constructed adapter's counters already start at
            // zero; reset is a no-op here since there is no long-lived
            // process for this one-shot tool to reach into.
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error constructing adapter: {}", e);
            EXIT_IOERR
        }
    }
}

pub fn cmd_random(flags: &Flags, n: usize) -> i32 {
    let mut buf = vec![0u8; n];
    if getrandom::getrandom(&mut buf).is_err() {
        eprintln!("error reading random bytes");
        return EXIT_IOERR;
    }
    let hex: String = buf.iter().map(|b| format!("{:02x}", b)).collect();
    print_result(flags, json!({"bytes": hex}), || hex.clone());
    EXIT_OK
}

pub fn make_help() -> String {
    r###"LQSR Network Hypervisor Control Tool

Usage: lqsrctl [-j] [-p <path>] <command> [args]

Global Options:
  -j                  Output raw JSON
  -p <path>           Use alternate data directory

Commands:
  help                Show this help
  version             Print version
  status              Show node status and configuration
  config show         Show persisted configuration
  config set metric <hop|rtt|pktpair|etx|wcett>
  config set crypto <true|false>
  config set damping <factor>
  iface list
  iface set <index> <receiveOnly> <channel> <bandwidthBps>
  cache addlink <from> <to> <inIf> <outIf> <metric>
  route query <dest>
  stats reset
  random <n>
"###
    .to_string()
}

pub fn dispatch(flags: Flags, matches: &ArgMatches) -> i32 {
    match matches.subcommand() {
        Some(("help", _)) => {
            print!("{}", make_help());
            EXIT_OK
        }
        Some(("version", _)) => {
            println!("0.1.0");
            EXIT_OK
        }
        Some(("status", _)) => cmd_status(&flags),
        Some(("config", sub)) => match sub.subcommand() {
            Some(("show", _)) => cmd_config_show(&flags),
            Some(("set", set_sub)) => match set_sub.subcommand() {
                Some(("metric", m)) => cmd_config_set_metric(&flags, m.value_of("kind").unwrap_or("hop")),
                Some(("crypto", m)) => cmd_config_set_crypto(&flags, m.value_of("enabled").unwrap_or("true") == "true"),
                Some(("damping", m)) => cmd_config_set_damping(&flags, m.value_of("factor").and_then(|v| v.parse().ok()).unwrap_or(0)),
                _ => EXIT_USAGE,
            },
            _ => EXIT_USAGE,
        },
        Some(("iface", sub)) => match sub.subcommand() {
            Some(("list", _)) => cmd_iface_list(&flags),
            Some(("set", m)) => {
                let idx = m.value_of("index").and_then(|v| v.parse().ok()).unwrap_or(0);
                let ro = m.value_of("receiveOnly").map(|v| v == "true").unwrap_or(false);
                let ch = m.value_of("channel").and_then(|v| v.parse().ok()).unwrap_or(0);
                let bw = m.value_of("bandwidthBps").and_then(|v| v.parse().ok()).unwrap_or(0);
                cmd_iface_set(&flags, idx, ro, ch, bw)
            }
            _ => EXIT_USAGE,
        },
        Some(("cache", sub)) => match sub.subcommand() {
            Some(("addlink", m)) => {
                let parse_mac = |s: &str| -> Option<MacAddr> {
                    let parts: Vec<u8> = s.split(['-', ':']).filter_map(|p| u8::from_str_radix(p, 16).ok()).collect();
                    if parts.len() == 6 {
                        Some(MacAddr::new([parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]]))
                    } else {
                        None
                    }
                };
                let from = m.value_of("from").and_then(parse_mac);
                let to = m.value_of("to").and_then(parse_mac);
                let in_if = m.value_of("inIf").and_then(|v| v.parse().ok()).unwrap_or(0);
                let out_if = m.value_of("outIf").and_then(|v| v.parse().ok()).unwrap_or(0);
                let metric = m.value_of("metric").and_then(|v| v.parse().ok()).unwrap_or(1);
                match (from, to) {
                    (Some(from), Some(to)) => cmd_cache_addlink(&flags, from, to, in_if, out_if, metric),
                    _ => {
                        eprintln!("invalid MAC address");
                        EXIT_USAGE
                    }
                }
            }
            _ => EXIT_USAGE,
        },
        Some(("route", sub)) => match sub.subcommand() {
            Some(("query", m)) => {
                let dest = m.value_of("dest").and_then(|s| {
                    let parts: Vec<u8> = s.split(['-', ':']).filter_map(|p| u8::from_str_radix(p, 16).ok()).collect();
                    (parts.len() == 6).then(|| MacAddr::new([parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]]))
                });
                match dest {
                    Some(dest) => cmd_route_query(&flags, dest),
                    None => {
                        eprintln!("invalid MAC address");
                        EXIT_USAGE
                    }
                }
            }
            _ => EXIT_USAGE,
        },
        Some(("stats", sub)) => match sub.subcommand() {
            Some(("reset", _)) => cmd_stats_reset(&flags),
            _ => EXIT_USAGE,
        },
        Some(("random", m)) => cmd_random(&flags, m.value_of("n").and_then(|v| v.parse().ok()).unwrap_or(16)),
        _ => {
            eprintln!("Invalid command line. Use 'help' for help.");
            EXIT_USAGE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_on_fresh_data_dir_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let flags = Flags { json_output: false, base_path: dir.path().to_string_lossy().to_string() };
        assert_eq!(cmd_status(&flags), EXIT_OK);
    }

    #[test]
    fn config_set_metric_persists() {
        let dir = tempfile::tempdir().unwrap();
        let flags = Flags { json_output: false, base_path: dir.path().to_string_lossy().to_string() };
        assert_eq!(cmd_config_set_metric(&flags, "etx"), EXIT_OK);
        let dd = DataDir::open(&flags.base_path).unwrap();
        assert_eq!(dd.config().metric, MetricKind::Etx);
    }

    #[test]
    fn config_set_metric_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let flags = Flags { json_output: false, base_path: dir.path().to_string_lossy().to_string() };
        assert_eq!(cmd_config_set_metric(&flags, "bogus"), EXIT_USAGE);
    }

    #[test]
    fn route_query_with_no_links_returns_no_route() {
        let dir = tempfile::tempdir().unwrap();
        let flags = Flags { json_output: false, base_path: dir.path().to_string_lossy().to_string() };
        assert_eq!(cmd_route_query(&flags, MacAddr::new([9; 6])), EXIT_OK);
    }
}
