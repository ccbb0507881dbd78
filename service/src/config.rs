use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::net::{IpAddr, SocketAddr};

/// Default port for the reliable (TCP) progress channel.
pub const DEFAULT_TCP_PORT: u16 = 9090;
/// Default port for the best-effort (UDP) notification channel.
pub const DEFAULT_UDP_PORT: u16 = 9091;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The host interface both listeners bind to
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub interface: IpAddr,

    /// The TCP port for the reliable progress sync channel
    #[arg(long, env, default_value_t = DEFAULT_TCP_PORT)]
    pub tcp_port: u16,

    /// The UDP port for the best-effort release notification channel
    #[arg(long, env, default_value_t = DEFAULT_UDP_PORT)]
    pub udp_port: u16,

    /// Maximum number of concurrent reliable-channel connections across all users
    #[arg(long, env, default_value_t = 100,
        value_parser = clap::value_parser!(u32).range(1..))]
    pub max_connections: u32,

    /// Capacity of the dispatch queue. Producers wait when it is full.
    #[arg(long, env, default_value_t = 64,
        value_parser = clap::value_parser!(u32).range(1..))]
    pub dispatch_queue_capacity: u32,

    /// Largest datagram the notification listener will read
    #[arg(long, env, default_value_t = 4096)]
    pub max_datagram_size: usize,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    /// Address the reliable progress channel listens on.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.tcp_port)
    }

    /// Address the best-effort notification channel listens on.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.udp_port)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections as usize
    }

    pub fn dispatch_queue_capacity(&self) -> usize {
        self.dispatch_queue_capacity as usize
    }
}
