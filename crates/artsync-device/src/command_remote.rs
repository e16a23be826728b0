//! Remote-wake adapter: runs a command with the wake target appended.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DeviceResult;
use crate::process::CommandSpec;
use crate::traits::RemoteWake;

pub struct CommandRemote {
    send: CommandSpec,
    timeout: Duration,
}

impl CommandRemote {
    pub fn new(send: CommandSpec, timeout: Duration) -> Self {
        Self { send, timeout }
    }
}

#[async_trait]
impl RemoteWake for CommandRemote {
    async fn send_wake_command(&self, target: &str) -> DeviceResult<()> {
        self.send.run(&[target, "KEY_POWER"], self.timeout).await?;
        Ok(())
    }
}
