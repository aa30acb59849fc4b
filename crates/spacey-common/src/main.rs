// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! spacey-common CLI - exercises the CommonJS stream core from the shell

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use spacey_common::modules::fs::{self, OpenOptions};
use spacey_common::modules::socket::{Family, Socket};
use spacey_common::modules::subprocess::{self, ProcessOptions};
use spacey_common::runtime::fiber;
use spacey_common::{Config, System, TextStream, VERSION};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "spacey-common",
    about = "CommonJS IO, filesystem, subprocess and socket modules for Spacey",
    version = VERSION,
    author = "Pegasus Heavy Industries"
)]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy files to standard output
    Cat {
        /// Files to print, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print a text file with line numbers
    Lines {
        /// File to read
        file: PathBuf,

        /// Charset of the file
        #[arg(long)]
        charset: Option<String>,
    },

    /// Run a command attached to this terminal and report its status
    Exec {
        /// Program to run
        program: String,

        /// Arguments for the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Echo every connection's input back to it
    Echo {
        /// Port to listen on
        #[arg(short, long, default_value_t = 7007)]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "spacey_common=debug"
    } else {
        "spacey_common=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config.as_deref() {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.load_from_env(std::env::vars())?;
            config
        }
        None => Config::load()?,
    };
    let system = System::install(config, std::env::args().collect())?;

    if let Err(e) = fiber::run(execute(system, cli.command)).await {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

async fn execute(system: &'static System, command: Command) -> spacey_common::Result<()> {
    match command {
        Command::Cat { files } => {
            let mut stdout = system.stdout()?.lock().await.raw().clone();
            for file in files {
                let input = fs::open_raw(&file, &OpenOptions::read()).await?;
                let copied = input.copy(&mut stdout).await;
                input.close().await?;
                copied?;
            }
            Ok(())
        }

        Command::Lines { file, charset } => {
            let raw = fs::open_raw(&file, &OpenOptions::read()).await?;
            let options = charset.map(spacey_common::io::TextOptions::charset);
            let mut input = TextStream::new(raw, options)?;

            let mut stdout = system.stdout()?.lock().await;
            let mut number = 0;
            input
                .for_each(|line| {
                    number += 1;
                    stdout.write_line(&format!("{:>6}  {}", number, line))
                })
                .await?;
            stdout.flush().await?;
            input.close().await
        }

        Command::Exec { program, args } => {
            let status = subprocess::system(&ProcessOptions::new(program).args(args)).await?;
            let label = "exit status:".dimmed().to_string();
            if status == 0 {
                eprintln!("{} {}", label, status.green());
            } else {
                eprintln!("{} {}", label, status.red());
            }
            Ok(())
        }

        Command::Echo { port, host } => {
            let mut server = Socket::new(Family::Inet)?;
            server.bind(&host, port).await?;
            server.listen(128)?;
            eprintln!(
                "{} listening on {}",
                "spacey-common".cyan().bold(),
                server.local_addr()?.yellow()
            );

            loop {
                let mut connection = server.accept().await?;
                let peer = connection.peer_addr()?;
                fiber::Builder::new()
                    .name(format!("echo-{}", peer))
                    .spawn(async move {
                        let stream = connection.get_stream()?;
                        let mut output = stream.clone();
                        stream.copy(&mut output).await?;
                        connection.close().await
                    });
            }
        }
    }
}
