//! Echo session
//!
//! A minimal [`Session`] that writes every byte it receives back to the
//! peer. Used by the `sessionpool-echo` binary and as a reference for
//! writing sessions.

use crate::channel::AsyncChannel;
use crate::session::{AllocateCallback, Session, SessionFactory};
use anyhow::{Context, Result};
use tracing::debug;

/// Session echoing incoming data back to the peer
#[derive(Debug)]
pub struct EchoSession {
    channel: AsyncChannel,
    one_shot: bool,
}

impl EchoSession {
    /// Create an echo session over `channel`
    ///
    /// A one-shot session closes the channel after echoing the first
    /// chunk of data it reads.
    pub fn new(channel: AsyncChannel, one_shot: bool) -> Self {
        EchoSession { channel, one_shot }
    }
}

impl Session for EchoSession {
    fn start(&mut self) -> Result<()> {
        let channel = self.channel.clone();
        let one_shot = self.one_shot;
        self.channel
            .read(1, move |buf| {
                let data = buf.split().freeze();
                if channel.write(data).is_err() {
                    return 0;
                }
                if one_shot {
                    channel.close();
                    return 0;
                }
                1
            })
            .context("Failed to start reading")?;
        debug!("Echo session {} started", self.channel.handle());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        debug!("Echo session {} stopped", self.channel.handle());
        Ok(())
    }

    fn channel(&self) -> &AsyncChannel {
        &self.channel
    }
}

/// Factory producing [`EchoSession`]s
#[derive(Debug, Default, Clone)]
pub struct EchoSessionFactory {
    one_shot: bool,
}

impl EchoSessionFactory {
    /// Factory for sessions echoing until the peer disconnects
    pub fn new() -> Self {
        EchoSessionFactory { one_shot: false }
    }

    /// Factory for sessions that echo one chunk and then close
    pub fn one_shot() -> Self {
        EchoSessionFactory { one_shot: true }
    }
}

impl SessionFactory for EchoSessionFactory {
    fn allocate(&self, channel: AsyncChannel, callback: AllocateCallback) {
        callback(Ok(Box::new(EchoSession::new(channel, self.one_shot))));
    }
}
