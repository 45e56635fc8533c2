//! Hotwire CLI Client
//!
//! Command-line interface for talking to a Hotwire server over the binary
//! protocol.

use clap::{Parser, Subcommand};
use hotwire::{CacheClient, ClientConfig};

/// Hotwire CLI
#[derive(Parser, Debug)]
#[command(name = "hotwire-cli")]
#[command(about = "CLI for a Hotwire remote cache")]
#[command(version)]
struct Args {
    /// Server address (host:port), repeatable
    #[arg(short, long, default_value = "127.0.0.1:11222")]
    server: Vec<String>,

    /// Cache to operate on (empty means the server's default cache)
    #[arg(short, long, default_value = "")]
    cache: String,

    /// Operation timeout in milliseconds
    #[arg(short, long, default_value = "10000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ping the server
    Ping,

    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Store a key-value pair
    Put {
        /// The key to store
        key: String,

        /// The value to store
        value: String,
    },

    /// Remove a key
    Del {
        /// The key to remove
        key: String,
    },

    /// Check whether a key is present
    Contains {
        /// The key to check
        key: String,
    },

    /// Number of entries in the cache
    Size,

    /// Remove every entry from the cache
    Clear,

    /// List the authentication mechanisms the server offers
    Mechs,
}

fn main() {
    let args = Args::parse();

    let config = ClientConfig::builder()
        .servers(args.server.iter().cloned())
        .cache_name(args.cache.clone())
        .operation_timeout_ms(args.timeout_ms)
        .build();

    if let Err(e) = run(config, &args) {
        eprintln!("(error) {}", e);
        std::process::exit(1);
    }
}

fn run(config: ClientConfig, args: &Args) -> hotwire::Result<()> {
    let client = CacheClient::connect(config)?;
    let cache = client.cache(&args.cache);

    match &args.command {
        Commands::Ping => {
            client.ping()?;
            println!("PONG");
        }
        Commands::Get { key } => match cache.get(key.as_bytes())? {
            Some(value) => println!("\"{}\"", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Put { key, value } => {
            cache.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Del { key } => {
            let removed = cache.remove(key.as_bytes())?;
            println!("(integer) {}", u8::from(removed));
        }
        Commands::Contains { key } => {
            let present = cache.contains_key(key.as_bytes())?;
            println!("(integer) {}", u8::from(present));
        }
        Commands::Size => println!("(integer) {}", cache.size()?),
        Commands::Clear => {
            cache.clear()?;
            println!("OK");
        }
        Commands::Mechs => {
            for (i, mech) in client.auth_mech_list()?.iter().enumerate() {
                println!("{}) \"{}\"", i + 1, mech);
            }
        }
    }

    client.close();
    Ok(())
}
