//! patchsync: hub process and interactive editing client.
//!
//! ```text
//! patchsync serve --bind 127.0.0.1:7266
//! patchsync client --url ws://127.0.0.1:7266
//! ```
//!
//! Logging goes through `env_logger`; set `RUST_LOG=debug` to see every
//! batch.

mod cli;
mod command;
mod session;

use std::error::Error;

use clap::Parser;
use patchsync_collab::SyncServer;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            let server = SyncServer::new(args.server_config());
            log::info!("Starting hub on {}", server.bind_addr());
            server.run().await?;
        }
        Commands::Client(args) => session::run(args.url, args.history_limit).await?,
    }
    Ok(())
}
