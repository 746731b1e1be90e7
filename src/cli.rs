use clap::{Arg, ArgAction, Command};
use std::ffi::OsString;
use std::net::IpAddr;

use echoping::{AddressFamily, PingConfig};

/// Requests sent when none of -t, -n or -d is given, like the Windows ping.
const DEFAULT_REQUESTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct PingArgs {
    pub target: String,
    pub continuous: bool,
    pub count: Option<u32>,
    pub duration: Option<f64>,
    pub interval: f64,
    pub size: u32,
    pub ttl: Option<u32>,
    pub timeout: u32,
    pub source_address: Option<IpAddr>,
    pub force_ipv4: bool,
    pub force_ipv6: bool,
}

impl Default for PingArgs {
    fn default() -> Self {
        Self {
            target: String::new(),
            continuous: false,
            count: None,
            duration: None,
            interval: 1.0,
            size: 32,      // Windows default
            ttl: None,
            timeout: 4000, // Windows default 4 seconds
            source_address: None,
            force_ipv4: false,
            force_ipv6: false,
        }
    }
}

impl PingArgs {
    pub fn to_config(&self) -> anyhow::Result<PingConfig> {
        let family = if self.force_ipv4 {
            AddressFamily::V4
        } else if self.force_ipv6 {
            AddressFamily::V6
        } else {
            AddressFamily::Any
        };

        let mut config = PingConfig::new(self.target.clone(), self.interval, self.timeout as f64 / 1000.0)
            .with_payload_size(self.size as usize)
            .with_family(family);

        if !self.continuous {
            let count = match (self.count, self.duration) {
                (None, None) => Some(DEFAULT_REQUESTS),
                (count, _) => count,
            };
            if let Some(count) = count {
                config = config.with_count(count);
            }
            if let Some(duration) = self.duration {
                config = config.with_max_duration(duration);
            }
        }

        if let Some(ttl) = self.ttl {
            config = config.with_ttl(ttl);
        }

        if let Some(source) = self.source_address {
            config = config.with_source(source);
        }

        config.validate()?;
        Ok(config)
    }
}

pub fn build_cli() -> Command {
    Command::new("echoping")
        .version("0.1.0")
        .about("Send ICMP echo requests and report replies, failures and jitter")
        .arg(
            Arg::new("target")
                .help("Target hostname or IP address")
                .required(true)
                .index(1)
        )
        .arg(
            Arg::new("continuous")
                .short('t')
                .help("Ping the specified host until stopped")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("count")
                .short('n')
                .help("Number of echo requests to send")
                .value_name("count")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .help("Stop after this many seconds")
                .value_name("seconds")
                .value_parser(clap::value_parser!(f64))
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .help("Seconds between echo requests")
                .value_name("seconds")
                .value_parser(clap::value_parser!(f64))
        )
        .arg(
            Arg::new("size")
                .short('l')
                .help("Send buffer size")
                .value_name("size")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("ttl")
                .short('i')
                .help("Time To Live")
                .value_name("TTL")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("timeout")
                .short('w')
                .help("Timeout in milliseconds to wait for each reply")
                .value_name("timeout")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("source_address")
                .short('S')
                .help("Source address to use")
                .value_name("srcaddr")
                .value_parser(clap::value_parser!(IpAddr))
        )
        .arg(
            Arg::new("force_ipv4")
                .short('4')
                .help("Force using IPv4")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("force_ipv6")
                .short('6')
                .help("Force using IPv6")
                .action(ArgAction::SetTrue)
        )
}

pub fn parse_args() -> anyhow::Result<PingArgs> {
    parse_args_from(std::env::args_os())
}

pub fn parse_args_from<I, T>(args: I) -> anyhow::Result<PingArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = build_cli().try_get_matches_from(args)?;

    let mut args = PingArgs::default();

    if let Some(target) = matches.get_one::<String>("target") {
        args.target = target.clone();
    }
    args.continuous = matches.get_flag("continuous");
    args.force_ipv4 = matches.get_flag("force_ipv4");
    args.force_ipv6 = matches.get_flag("force_ipv6");
    args.count = matches.get_one::<u32>("count").copied();
    args.duration = matches.get_one::<f64>("duration").copied();
    args.ttl = matches.get_one::<u32>("ttl").copied();
    args.source_address = matches.get_one::<IpAddr>("source_address").copied();

    if let Some(interval) = matches.get_one::<f64>("interval") {
        args.interval = *interval;
    }

    if let Some(size) = matches.get_one::<u32>("size") {
        args.size = *size;
    }

    if let Some(timeout) = matches.get_one::<u32>("timeout") {
        args.timeout = *timeout;
    }

    // Validation
    if args.force_ipv4 && args.force_ipv6 {
        return Err(anyhow::anyhow!("Cannot force both IPv4 and IPv6"));
    }

    if args.continuous {
        // Continuous mode overrides count and duration
        args.count = None;
        args.duration = None;
    }

    Ok(args)
}
