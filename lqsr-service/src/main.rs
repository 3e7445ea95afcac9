// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// lqsrctl: a one-shot local control tool for a node's persisted LQSR
// configuration and link cache, structured after the teacher's own
// `zerotier-system-service/src/main.rs` (module declarations straight off
// `main.rs`, a clap v3 builder `Command` tree, a `Flags` struct threaded
// into every dispatch).

use clap::{Arg, Command};

pub mod cli;
pub mod datadir;
pub mod localconfig;
pub mod log;
pub mod service;

fn build_cli() -> Command<'static> {
    Command::new("lqsrctl")
        .version("0.1.0")
        .override_help(cli::make_help())
        .arg(Arg::new("json").short('j').help("Output raw JSON").takes_value(false))
        .arg(Arg::new("path").short('p').help("Use alternate data directory").takes_value(true))
        .subcommand(Command::new("help"))
        .subcommand(Command::new("version"))
        .subcommand(Command::new("status"))
        .subcommand(
            Command::new("config").subcommand(Command::new("show")).subcommand(
                Command::new("set")
                    .subcommand(Command::new("metric").arg(Arg::new("kind").required(true)))
                    .subcommand(Command::new("crypto").arg(Arg::new("enabled").required(true)))
                    .subcommand(Command::new("damping").arg(Arg::new("factor").required(true))),
            ),
        )
        .subcommand(
            Command::new("iface").subcommand(Command::new("list")).subcommand(
                Command::new("set")
                    .arg(Arg::new("index").required(true))
                    .arg(Arg::new("receiveOnly").required(true))
                    .arg(Arg::new("channel").required(true))
                    .arg(Arg::new("bandwidthBps").required(true)),
            ),
        )
        .subcommand(
            Command::new("cache").subcommand(
                Command::new("addlink")
                    .arg(Arg::new("from").required(true))
                    .arg(Arg::new("to").required(true))
                    .arg(Arg::new("inIf").required(true))
                    .arg(Arg::new("outIf").required(true))
                    .arg(Arg::new("metric").required(true)),
            ),
        )
        .subcommand(Command::new("route").subcommand(Command::new("query").arg(Arg::new("dest").required(true))))
        .subcommand(Command::new("stats").subcommand(Command::new("reset")))
        .subcommand(Command::new("random").arg(Arg::new("n").required(false)))
}

fn main() {
    let app = build_cli();
    let matches = match app.try_get_matches() {
        Ok(m) => m,
        Err(e) => {
            if e.kind() == clap::ErrorKind::DisplayHelp || e.kind() == clap::ErrorKind::DisplayVersion {
                print!("{}", e);
                std::process::exit(cli::EXIT_OK);
            } else {
                eprintln!("{}", e);
                std::process::exit(cli::EXIT_USAGE);
            }
        }
    };

    let flags = cli::Flags {
        json_output: matches.is_present("json"),
        base_path: matches.value_of("path").unwrap_or("/var/lib/lqsr").to_string(),
    };

    std::process::exit(cli::dispatch(flags, &matches));
}
