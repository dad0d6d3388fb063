// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tokio::runtime;
use tracing::info;
use vecwire::request::Context;
use vecwire::routing::{Route, Router, SyncHandler, Verb};
use vecwire::transfer::{SyncBatchHandler, TransferService};
use vecwire::{setup_tracing, AppResult, Server, ServerConfig};

/// How long in-flight requests get to finish after Ctrl-C.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    // an explicit RUST_LOG wins over -v
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let server_config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", server_config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _tracing_guard = setup_tracing(&commandline.log_dir);

    rt.block_on(run(Arc::new(server_config)))
}

async fn run(config: Arc<ServerConfig>) -> AppResult<()> {
    let mut router = Router::new().route(Route::new(
        "/health",
        Verb::GET,
        SyncHandler::new(|ctx: &mut Context| {
            ctx.response.text(200, "ok");
            Ok(())
        }),
    )?);

    let transfer = TransferService::new(config.transfer_options());
    transfer.register(
        &mut router,
        "/echo",
        Verb::CREATE,
        SyncBatchHandler::new(|_batch, header| {
            info!("echo batch {} of session {}", header.batch, header.id);
            Ok(None)
        }),
    )?;

    let mut server = Server::builder(config).router(router).build();
    let addr = server.start().await?;
    info!("vecwire listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    server.stop(Some(SHUTDOWN_WAIT)).await
}
