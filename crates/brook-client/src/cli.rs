//! Command-line interface definition and command runners.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ClientConfig;
use crate::context::{Context, ContextState};
use crate::driver;
use crate::error::{ClientError, ClientResult};

/// brook - client for the brook audio server
#[derive(Debug, Parser)]
#[command(name = "brook")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "BROOK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Server to connect to: a socket path or host[:port]
    #[arg(long, short)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect, report the server state, and disconnect
    Status,
    /// Ask the server to shut down
    Exit,
}

/// Connects a context, runs it to a terminal state, and reports a fatal
/// outcome as an error.
async fn run_to_completion(mut ctx: Context, server: Option<&str>) -> ClientResult<()> {
    ctx.connect(server)?;
    driver::run(&mut ctx).await?;
    match ctx.state() {
        ContextState::Terminated => Ok(()),
        _ => Err(ClientError::Connection(format!(
            "connection failed: {}",
            ctx.last_error()
        ))),
    }
}

pub async fn status(config: ClientConfig, server: Option<&str>) -> ClientResult<()> {
    let mut ctx = Context::with_config("brook-cli", config);
    ctx.set_state_callback(|c| {
        if c.state() == ContextState::Ready {
            println!("server is up");
            c.disconnect();
        }
    });
    run_to_completion(ctx, server).await
}

pub async fn exit(config: ClientConfig, server: Option<&str>) -> ClientResult<()> {
    let mut ctx = Context::with_config("brook-cli", config);
    ctx.set_state_callback(|c| {
        if c.state() == ContextState::Ready {
            // The reply may never arrive if the server obliges quickly, so
            // a failed ack after EXIT is not reported.
            let _ = c.exit_daemon(|c, success| {
                if success {
                    println!("exit request acknowledged");
                }
                c.disconnect();
            });
        }
    });
    ctx.connect(server)?;
    driver::run(&mut ctx).await?;
    match ctx.state() {
        ContextState::Terminated => Ok(()),
        ContextState::Failed => {
            // A server that exits immediately drops the connection.
            println!("server connection closed");
            Ok(())
        }
        state => Err(ClientError::Connection(format!(
            "unexpected final state: {}",
            state
        ))),
    }
}
