//! STUN Relay Agent
//!
//! Reads control commands from stdin, one per line, and writes one reply line
//! per command to stdout. Logs go to stderr.
// Copyright 2025 Francisco F. Pinochet
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


use anyhow::Result;
use media_relay::{ControlDispatcher, ControlMessage, DispatchOutcome, RelayState};
use relay_config::{LogFormat, RelayConfig};
use relay_logging::{init_console_logging, init_logging};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "stun-relay";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = RelayConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    match config.log_format {
        LogFormat::Json => init_logging(SERVICE_NAME, &config.log_level),
        LogFormat::Console => init_console_logging(SERVICE_NAME, &config.log_level),
    }

    info!("Starting STUN Relay Agent");

    if let Err(e) = media_srtp::self_test() {
        error!(error = %e, "SRTP self test failed");
        return Err(anyhow::anyhow!("Failed to initialise SRTP: {}", e));
    }

    info!(
        default_iface = %config.default_iface,
        default_ports = %config.default_ports,
        recv_buffer_size = config.recv_buffer_size,
        "Configuration loaded"
    );

    let state = RelayState::new(config.recv_buffer_size);
    let dispatcher = ControlDispatcher::new(state, config.default_iface, config.default_ports);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Control channel closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read control channel");
                break;
            }
        };

        let message = match ControlMessage::parse_line(&line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Ignoring control line");
                continue;
            }
        };

        match dispatcher.handle(&message).await {
            DispatchOutcome::Reply(reply) => {
                let mut out = reply.to_line();
                out.push('\n');
                if let Err(e) = write_reply(&mut stdout, &out).await {
                    warn!(error = %e, "Failed to write reply");
                    break;
                }
            }
            DispatchOutcome::Shutdown => {
                info!("Shutdown requested");
                break;
            }
            DispatchOutcome::Ignored => {}
        }
    }

    dispatcher.shutdown().await;
    info!("STUN Relay Agent stopped");

    Ok(())
}

async fn write_reply(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await
}
