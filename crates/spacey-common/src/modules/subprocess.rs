// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Subprocess module
//!
//! A child's stdin, stdout and stderr are ordinary [`Stream`]s, wrapped as
//! text unless the process was created in binary mode. [`Process::wait`]
//! suspends the calling fiber until the child exits.

use crate::binary::{Binary, Charset};
use crate::error::{CommonError, Result};
use crate::io::{AnyStream, Stream, TextOptions, TextStream};
use crate::runtime::fiber::{self, Fiber, Resumer};
use crate::runtime::system::System;
use nix::sys::signal::{self as nix_signal, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

/// What to run and how
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Program to execute
    pub command: String,
    /// Arguments after the program
    pub args: Vec<String>,
    /// Working directory of the child
    pub dir: Option<PathBuf>,
    /// Complete environment of the child. `None` inherits ours.
    pub env: Option<HashMap<String, String>>,
    /// Use raw streams instead of text streams
    pub binary: bool,
    /// Charset of the text streams
    pub encoding: Option<String>,
}

impl ProcessOptions {
    /// Run `command` with no arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Run `sh -c script`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Add an environment variable. The first call replaces the inherited
    /// environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Switch to raw streams
    pub fn binary(mut self) -> Self {
        self.binary = true;
        self
    }

    /// Set the charset of the text streams
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }
}

#[derive(Debug, Default)]
struct ExitState {
    outcome: Option<Result<i32>>,
    waiters: Vec<Resumer<i32>>,
}

/// A running or finished child process
#[derive(Debug)]
pub struct Process {
    pid: Option<u32>,
    stdin: AnyStream,
    stdout: AnyStream,
    stderr: AnyStream,
    exit: Arc<Mutex<ExitState>>,
}

/// Spawn a child with piped standard streams.
///
/// A spawn failure is returned immediately.
pub fn create_process(options: &ProcessOptions) -> Result<Process> {
    let mut command = tokio::process::Command::new(&options.command);
    command
        .args(&options.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &options.dir {
        command.current_dir(dir);
    }
    if let Some(env) = &options.env {
        command.env_clear().envs(env);
    }

    let mut child = command.spawn().map_err(|err| {
        CommonError::io(
            err.kind(),
            format!("failed to spawn {}: {}", options.command, err),
        )
    })?;
    let pid = child.id();
    tracing::debug!(command = %options.command, ?pid, "spawned process");

    let missing = || CommonError::state("child stream was not piped");
    let stdin = Stream::from_writer(child.stdin.take().ok_or_else(missing)?);
    let stdout = Stream::from_reader(child.stdout.take().ok_or_else(missing)?);
    let stderr = Stream::from_reader(child.stderr.take().ok_or_else(missing)?);

    let wrap = |stream: Stream| -> Result<AnyStream> {
        if options.binary {
            return Ok(AnyStream::Raw(stream));
        }
        let text_options = options.encoding.clone().map(TextOptions::charset);
        Ok(AnyStream::Text(TextStream::new(stream, text_options)?))
    };
    let process = Process {
        pid,
        stdin: wrap(stdin)?,
        stdout: wrap(stdout)?,
        stderr: wrap(stderr)?,
        exit: Arc::new(Mutex::new(ExitState::default())),
    };

    let exit = process.exit.clone();
    tokio::spawn(async move {
        let outcome = child
            .wait()
            .await
            .map(exit_code)
            .map_err(CommonError::from);
        tracing::debug!(?pid, ?outcome, "process exited");

        let waiters = {
            let mut exit = exit.lock();
            exit.outcome = Some(outcome.clone());
            std::mem::take(&mut exit.waiters)
        };
        for waiter in waiters {
            waiter.settle(outcome.clone());
        }
    });

    Ok(process)
}

/// The exit code, or 128 plus the signal number for a killed child
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

impl Process {
    /// Operating system process id, if the child is still known
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The child's input
    pub fn stdin(&self) -> &AnyStream {
        &self.stdin
    }

    /// The child's input, mutably
    pub fn stdin_mut(&mut self) -> &mut AnyStream {
        &mut self.stdin
    }

    /// The child's output
    pub fn stdout(&self) -> &AnyStream {
        &self.stdout
    }

    /// The child's output, mutably
    pub fn stdout_mut(&mut self) -> &mut AnyStream {
        &mut self.stdout
    }

    /// The child's error output
    pub fn stderr(&self) -> &AnyStream {
        &self.stderr
    }

    /// The child's error output, mutably
    pub fn stderr_mut(&mut self) -> &mut AnyStream {
        &mut self.stderr
    }

    /// Suspend until the child exits and return its exit code
    pub async fn wait(&self) -> Result<i32> {
        let suspension = {
            let mut exit = self.exit.lock();
            if let Some(outcome) = &exit.outcome {
                return outcome.clone();
            }
            let (resumer, suspension) = fiber::suspend()?;
            exit.waiters.push(resumer);
            suspension
        };
        suspension.wait().await
    }

    /// The exit code, if the child has exited
    pub fn exit_status(&self) -> Option<i32> {
        match &self.exit.lock().outcome {
            Some(Ok(code)) => Some(*code),
            _ => None,
        }
    }

    /// Send `signal` to the child
    pub fn kill(&self, signal: i32) -> Result<()> {
        if self.exit.lock().outcome.is_some() {
            return Err(CommonError::state("process has already exited"));
        }
        let pid = self
            .pid
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| CommonError::state("process id is unknown"))?;
        let signal = Signal::try_from(signal)?;
        tracing::debug!(pid, %signal, "signalling process");
        nix_signal::kill(Pid::from_raw(pid), signal)?;
        Ok(())
    }

    /// Send SIGTERM to the child
    pub fn terminate(&self) -> Result<()> {
        self.kill(Signal::SIGTERM as i32)
    }

    /// Copy `input` into the child's stdin, and the child's stdout and
    /// stderr into `output` and `errput`, each in its own fiber.
    ///
    /// The child's stdin is closed once `input` is exhausted.
    pub fn connect(&self, input: Option<Stream>, output: Stream, errput: Stream) -> Vec<Fiber> {
        let mut fibers = Vec::with_capacity(3);
        if let Some(input) = input {
            let mut stdin = self.stdin.raw().clone();
            fibers.push(fiber::Builder::new().name("stdin-copy").spawn(async move {
                input.copy(&mut stdin).await?;
                stdin.close().await
            }));
        }
        for (name, source, mut target) in [
            ("stdout-copy", self.stdout.raw().clone(), output),
            ("stderr-copy", self.stderr.raw().clone(), errput),
        ] {
            fibers.push(fiber::Builder::new().name(name).spawn(async move {
                source.copy(&mut target).await
            }));
        }
        fibers
    }
}

/// Run a child to completion and return its standard output.
///
/// A non-zero exit fails with `(status) stderr`.
pub async fn command(options: &ProcessOptions) -> Result<String> {
    let process = create_process(&options.clone().binary())?;
    process.stdin.raw().close().await?;
    let (output, errput) = futures::try_join!(
        process.stdout.raw().read_all(),
        process.stderr.raw().read_all()
    )?;
    let status = process.wait().await?;

    let charset = match &options.encoding {
        Some(name) => Charset::parse(name)?,
        None => Charset::parse(&crate::runtime::system::config().charset)?,
    };
    if status != 0 {
        return Err(CommonError::Process(format!(
            "({}) {}",
            status,
            charset.decode(errput.as_slice())
        )));
    }
    Ok(charset.decode(output.as_slice()))
}

/// Run a child attached to our stdout and stderr and return its exit code
pub async fn system(options: &ProcessOptions) -> Result<i32> {
    let (output, errput) = standard_output().await?;
    run_connected(options, output, errput).await
}

/// Run a child with its output discarded and return its exit code
pub async fn status(options: &ProcessOptions) -> Result<i32> {
    let discard = || Stream::from_writer(tokio::io::sink());
    run_connected(options, discard(), discard()).await
}

async fn run_connected(options: &ProcessOptions, output: Stream, errput: Stream) -> Result<i32> {
    let process = create_process(options)?;
    process.stdin.raw().close().await?;
    let copies = process.connect(None, output, errput);
    let status = process.wait().await?;
    for copy in copies {
        copy.join().await;
    }
    Ok(status)
}

/// Raw handles of the installed standard streams, or fresh ones when no
/// system context exists
async fn standard_output() -> Result<(Stream, Stream)> {
    match System::global() {
        Ok(system) => {
            let output = system.stdout()?.lock().await.raw().clone();
            let errput = system.stderr()?.lock().await.raw().clone();
            Ok((output, errput))
        }
        Err(_) => Ok((
            Stream::from_writer(tokio::io::stdout()),
            Stream::from_writer(tokio::io::stderr()),
        )),
    }
}
