use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cache::CacheConfig;
use crate::db::DB_FILE;
use crate::server::ServeConfig;
use crate::service::ServiceConfig;

#[derive(Debug, Parser)]
#[command(name = "order-cache")]
#[command(about = "Order service with an expiring in-memory cache in front of SQLite.")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the SQLite order store
    #[arg(long, global = true, env = "ORDER_CACHE_DB", default_value = DB_FILE)]
    pub db: PathBuf,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bus subscriber and the HTTP lookup server
    Serve(ServeArgs),

    /// Publish synthetic orders to a running bus
    Publish {
        /// Bus address to connect to
        #[arg(long, default_value = "127.0.0.1:4222")]
        bus_addr: String,

        /// Number of orders to send
        #[arg(long, default_value = "10")]
        count: u32,

        /// Pause between orders in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Print one stored order
    Show {
        /// Order UID to look up
        order_uid: String,
    },

    /// Row counts of the order store
    Stats,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:3000")]
    pub http_addr: String,

    /// Message bus listen address
    #[arg(long, default_value = "0.0.0.0:4222")]
    pub bus_addr: String,

    /// Cache default TTL in seconds (0 = entries never expire by default)
    #[arg(long, default_value = "900")]
    pub default_ttl_secs: u64,

    /// Seconds between expired-entry sweeps (0 = no background sweep)
    #[arg(long, default_value = "180")]
    pub sweep_interval_secs: u64,

    /// TTL in seconds for orders the service caches
    #[arg(long, default_value = "300")]
    pub entry_ttl_secs: u64,

    /// Skip preloading stored orders at startup
    #[arg(long)]
    pub no_warm_up: bool,
}

impl ServeArgs {
    pub fn to_config(&self, db: PathBuf) -> ServeConfig {
        ServeConfig {
            db_path: db,
            http_addr: self.http_addr.clone(),
            bus_addr: self.bus_addr.clone(),
            cache: CacheConfig::new(
                Duration::from_secs(self.default_ttl_secs),
                Duration::from_secs(self.sweep_interval_secs),
            ),
            service: ServiceConfig {
                entry_ttl: Duration::from_secs(self.entry_ttl_secs),
            },
            warm_up: !self.no_warm_up,
        }
    }
}
