use clap::{Args, Parser, Subcommand};

pub const DEFAULT_PORT: u16 = 7000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Interface the server listens on.
    pub host: String,

    /// TCP port to listen on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username requested when joining.
    #[arg(long)]
    pub username: String,

    /// Host the relay server runs on.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// TCP port of the relay server.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}
