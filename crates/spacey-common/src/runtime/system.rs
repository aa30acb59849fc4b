// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Process-wide context: configuration, arguments, environment and the
//! standard streams
//!
//! A [`System`] is installed once at startup. Components that only need
//! defaults read [`config()`], which works before install as well.

use crate::config::Config;
use crate::error::{CommonError, Result};
use crate::io::{Stream, StreamOptions, TextOptions, TextStream};
use crate::runtime::fiber;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub use crate::runtime::fiber::spawn;

static GLOBAL: OnceCell<System> = OnceCell::new();

/// A standard stream shared by every fiber
pub type StdStream = AsyncMutex<TextStream<Stream>>;

/// Process-wide state
pub struct System {
    config: Config,
    args: Vec<String>,
    env: HashMap<String, String>,
    stdin: OnceCell<StdStream>,
    stdout: OnceCell<StdStream>,
    stderr: OnceCell<StdStream>,
}

impl System {
    /// Create a context, snapshotting the current environment
    pub fn new(config: Config, args: Vec<String>) -> Self {
        Self {
            config,
            args,
            env: std::env::vars().collect(),
            stdin: OnceCell::new(),
            stdout: OnceCell::new(),
            stderr: OnceCell::new(),
        }
    }

    /// Install the process-wide context. Fails if one is already installed.
    pub fn install(config: Config, args: Vec<String>) -> Result<&'static System> {
        GLOBAL
            .set(Self::new(config, args))
            .map_err(|_| CommonError::state("system is already installed"))?;
        tracing::debug!("installed system context");
        Self::global()
    }

    /// The installed context
    pub fn global() -> Result<&'static System> {
        GLOBAL
            .get()
            .ok_or_else(|| CommonError::state("system has not been installed"))
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Command line arguments
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment at the time the context was created
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Standard input as text. Created on first use, which must happen on
    /// the runtime.
    pub fn stdin(&self) -> Result<&StdStream> {
        self.stdin.get_or_try_init(|| {
            self.text(Stream::from_reader_with(tokio::io::stdin(), self.stream_options()))
        })
    }

    /// Standard output as text
    pub fn stdout(&self) -> Result<&StdStream> {
        self.stdout.get_or_try_init(|| {
            self.text(Stream::from_writer_with(tokio::io::stdout(), self.stream_options()))
        })
    }

    /// Standard error as text
    pub fn stderr(&self) -> Result<&StdStream> {
        self.stderr.get_or_try_init(|| {
            self.text(Stream::from_writer_with(tokio::io::stderr(), self.stream_options()))
        })
    }

    /// Print the arguments to standard output as one line
    pub async fn print<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        let line = args
            .into_iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>();
        self.stdout()?.lock().await.print(line).await
    }

    /// Terminate the process. Output that has not been flushed is lost.
    pub fn exit(&self, code: i32) -> ! {
        tracing::debug!(code, "exiting");
        std::process::exit(code)
    }

    fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            block_size: self.config.block_size,
            high_water_mark: self.config.high_water_mark,
        }
    }

    fn text(&self, raw: Stream) -> Result<StdStream> {
        let options = TextOptions {
            charset: Some(self.config.charset.clone()),
            newline: Some(self.config.newline.clone()),
            delimiter: Some(self.config.delimiter.clone()),
        };
        Ok(AsyncMutex::new(TextStream::new(raw, Some(options))?))
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("config", &self.config)
            .field("args", &self.args)
            .field("env", &self.env.len())
            .finish()
    }
}

/// The installed configuration, or the defaults before install
pub fn config() -> Config {
    GLOBAL
        .get()
        .map(|system| system.config.clone())
        .unwrap_or_default()
}

/// Suspend the current fiber for `duration`
pub async fn sleep(duration: Duration) -> Result<()> {
    fiber::wait_for(async move {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}
