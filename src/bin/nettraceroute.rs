use colored::*;

use clap::{App, AppSettings, Arg};

use std::process;
use std::sync::atomic::Ordering;

use anyhow::anyhow;

use netdiag::cli;
use netdiag::traceroute::{self, HopResult, TraceConfig};

fn main() {
    cli::init_logging();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "nettraceroute:".red().bold(), e);
            2
        }
    };
    process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let matches = App::new("nettraceroute")
        .setting(AppSettings::ColoredHelp)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Trace the route packets take to reach a host.")
        .arg(Arg::with_name("DESTINATION")
            .help("Hostname or IP address")
            .required(true)
            .index(1))
        .arg(Arg::with_name("max-hops")
            .help("Maximum number of hops")
            .short("m")
            .long("max-hops")
            .takes_value(true)
            .default_value("30")
            .validator(cli::validate_number::<u8>))
        .arg(Arg::with_name("timeout")
            .help("How long to wait for each probe (ex: 3, 1s, 400ms)")
            .short("t")
            .long("timeout")
            .takes_value(true)
            .default_value("3")
            .validator(cli::validate_duration))
        .arg(Arg::with_name("probes")
            .help("Number of probes per hop")
            .short("q")
            .long("probes")
            .takes_value(true)
            .default_value("3")
            .validator(cli::validate_number::<u16>))
        .arg(Arg::with_name("numeric")
            .help("Do not look up host names for hops")
            .short("n")
            .long("numeric"))
        .get_matches();

    let destination_host = matches
        .value_of("DESTINATION")
        .ok_or_else(|| anyhow!("missing destination"))?;
    let max_hops = matches.value_of("max-hops").unwrap_or("30").parse::<u8>()?;
    let timeout = cli::parse_duration(matches.value_of("timeout").unwrap_or("3")).map_err(anyhow::Error::msg)?;
    let probes = matches.value_of("probes").unwrap_or("3").parse::<u16>()?;

    let config = TraceConfig {
        max_hops,
        timeout,
        probes,
        resolve_hostnames: !matches.is_present("numeric"),
        ..TraceConfig::default()
    };

    let mut stream = match traceroute::traceroute_stream_with_config(destination_host, config) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} {}", "nettraceroute:".red().bold(), e);
            return Ok(1);
        }
    };

    let running = cli::interrupt_flag()?;

    println!("{}", stream.banner().cyan());

    while running.load(Ordering::SeqCst) {
        match stream.next() {
            Some(hop) => print_hop(&hop, stream.reached()),
            None => return Ok(if stream.reached() { 0 } else { 1 }),
        }
    }

    println!("\n{}", "--- traceroute interrupted ---".yellow());
    Ok(130)
}

fn print_hop(hop: &HopResult, is_destination: bool) {
    let line = hop.to_string();
    if hop.is_timeout {
        println!("{}", line.red());
    } else if is_destination {
        println!("{}", line.green().bold());
    } else {
        println!("{}", line);
    }
}
