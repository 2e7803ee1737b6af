//! Command-line arguments for the `patchsync` binary.

use clap::{Parser, Subcommand};
use patchsync_collab::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "patchsync")]
#[command(about = "Optimistic JSON patch synchronization: hub and interactive client")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the synchronization hub
    Serve(ServeArgs),
    /// Edit the shared document interactively
    Client(ClientArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7266", env = "PATCHSYNC_BIND")]
    pub bind: String,

    /// Frames buffered per connection before a slow peer is disconnected
    #[arg(long, default_value_t = 256)]
    pub broadcast_capacity: usize,

    /// Accept batches even if they break the `nodes` document shape
    #[arg(long)]
    pub no_shape_check: bool,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            broadcast_capacity: self.broadcast_capacity,
            enforce_shape: !self.no_shape_check,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ClientArgs {
    /// Hub to connect to
    #[arg(short, long, default_value = "ws://127.0.0.1:7266", env = "PATCHSYNC_URL")]
    pub url: String,

    /// Undo steps kept per stack
    #[arg(long, default_value_t = 100)]
    pub history_limit: usize,
}
