use colored::*;

use clap::{App, AppSettings, Arg};

use std::process;
use std::sync::atomic::Ordering;

use anyhow::anyhow;

use netdiag::cli;
use netdiag::ping::{self, PingConfig, PingEvent, ReplyType};

fn main() {
    cli::init_logging();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "netping:".red().bold(), e);
            2
        }
    };
    process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let matches = App::new("netping")
        .setting(AppSettings::ColoredHelp)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Send ICMP echo requests to a host and report round-trip statistics.")
        .arg(Arg::with_name("DESTINATION")
            .help("Hostname or IP address")
            .required(true)
            .index(1))
        .arg(Arg::with_name("count")
            .help("Number of echo requests to send")
            .short("c")
            .long("count")
            .takes_value(true)
            .default_value("4")
            .validator(cli::validate_number::<u16>))
        .arg(Arg::with_name("timeout")
            .help("How long to wait for each reply (ex: 5, 1s, 400ms)")
            .short("t")
            .long("timeout")
            .takes_value(true)
            .default_value("5")
            .validator(cli::validate_duration))
        .arg(Arg::with_name("interval")
            .help("How long to wait in between pings")
            .short("i")
            .long("interval")
            .takes_value(true)
            .default_value("1s")
            .validator(cli::validate_duration))
        .arg(Arg::with_name("ttl")
            .help("Set ttl on outgoing packets")
            .long("ttl")
            .takes_value(true)
            .validator(cli::validate_number::<u8>))
        .arg(Arg::with_name("numeric")
            .help("Do not look up host names for replies")
            .short("n")
            .long("numeric"))
        .get_matches();

    let destination_host = matches
        .value_of("DESTINATION")
        .ok_or_else(|| anyhow!("missing destination"))?;
    let count = matches.value_of("count").unwrap_or("4").parse::<u16>()?;
    let timeout = cli::parse_duration(matches.value_of("timeout").unwrap_or("5")).map_err(anyhow::Error::msg)?;
    let interval = cli::parse_duration(matches.value_of("interval").unwrap_or("1s")).map_err(anyhow::Error::msg)?;
    let ttl = match matches.value_of("ttl") {
        Some(ttl) => Some(u32::from(ttl.parse::<u8>()?)),
        None => None,
    };

    let config = PingConfig {
        count,
        timeout,
        interval,
        ttl,
        resolve_hostnames: !matches.is_present("numeric"),
        ..PingConfig::default()
    };

    let mut stream = match ping::ping_stream_with_config(destination_host, config) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} {}", "netping:".red().bold(), e);
            return Ok(1);
        }
    };

    let running = cli::interrupt_flag()?;

    println!("{}", stream.banner().cyan());

    while running.load(Ordering::SeqCst) {
        match stream.next() {
            Some(event) => print_event(&event),
            None => return Ok(if stream.is_reachable() { 0 } else { 1 }),
        }
    }

    // Interrupted: report what we have, then let the stream close the socket
    println!();
    print_event(&PingEvent::Summary(stream.result()));
    Ok(130)
}

fn print_event(event: &PingEvent) {
    let line = event.to_string();
    match event {
        PingEvent::Pong(pong) if pong.mtype == ReplyType::Reply => println!("{}", line),
        PingEvent::Pong(_) => println!("{}", line.yellow()),
        PingEvent::Timeout { .. } => println!("{}", line.red()),
        PingEvent::Failed { .. } => eprintln!("{} {}", "netping:".red().bold(), line),
        PingEvent::Summary(result) => {
            println!();
            let mut lines = line.lines();
            if let Some(header) = lines.next() {
                println!("{}", header.yellow());
            }
            for rest in lines {
                if result.is_reachable {
                    println!("{}", rest.bold());
                } else {
                    println!("{}", rest.red().bold());
                }
            }
        }
    }
}
