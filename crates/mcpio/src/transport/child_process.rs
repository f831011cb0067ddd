//! Spawn a subprocess and speak the stdio transport over its pipes.

use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::{
    model::JsonRpcMessage,
    transport::{Transport, async_rw::AsyncRwTransport},
};

/// A child process whose stdin/stdout carry newline-delimited JSON frames.
/// The child's stderr is inherited so its diagnostics stay visible.
///
/// The child is killed when the transport is closed or dropped.
pub struct TokioChildProcess {
    child: Child,
    transport: AsyncRwTransport<ChildStdout, ChildStdin>,
    closed: bool,
}

impl TokioChildProcess {
    pub fn new(mut command: Command) -> std::io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdout not piped")
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdin not piped")
        })?;
        Ok(Self {
            child,
            transport: AsyncRwTransport::new(stdout, stdin),
            closed: false,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Transport for TokioChildProcess {
    type Error = std::io::Error;

    fn send(
        &mut self,
        item: JsonRpcMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.transport.send(item)
    }

    fn receive(&mut self) -> impl Future<Output = Option<JsonRpcMessage>> + Send {
        self.transport.receive()
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.close().await?;
        if self.child.start_kill().is_ok() {
            let status = self.child.wait().await?;
            tracing::debug!(?status, "child process exited");
        }
        Ok(())
    }
}
