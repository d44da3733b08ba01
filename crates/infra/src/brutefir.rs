//! BruteFIR filter engine client
//!
//! Talks to the BruteFIR command line interface over its local TCP port.
//! Each coefficient change opens a connection, issues one `cfc` per
//! configured filter followed by `quit`, and inspects the reply.

use phire_core::domain::config::FilterEngineConfig;
use phire_core::domain::error::PreampError;
use phire_core::domain::preamp::FilterEngine;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors that can occur talking to BruteFIR
#[derive(Debug, Error)]
pub enum BruteFirError {
    #[error("Cannot reach BruteFIR at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("BruteFIR connection error: {0}")]
    Io(#[from] io::Error),

    #[error("BruteFIR rejected '{command}': {reply}")]
    Rejected { command: String, reply: String },
}

impl From<BruteFirError> for PreampError {
    fn from(e: BruteFirError) -> Self {
        PreampError::ExternalEngine(e.to_string())
    }
}

/// Client for the BruteFIR CLI
pub struct BruteFir {
    addr: String,
    filters: Vec<String>,
    timeout: Duration,
}

impl BruteFir {
    pub fn new(host: &str, port: u16, filters: Vec<String>, timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            filters,
            timeout,
        }
    }

    pub fn from_config(config: &FilterEngineConfig) -> Self {
        Self::new(
            &config.host,
            config.port,
            config.filters.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    /// Command line switching every filter to `coefficients`
    pub fn command(&self, coefficients: &str) -> String {
        let mut command: String = self
            .filters
            .iter()
            .map(|filter| format!("cfc \"{}\" \"{}\"; ", filter, coefficients))
            .collect();
        command.push_str("quit;\n");
        command
    }

    fn connect(&self) -> Result<TcpStream, BruteFirError> {
        let connect_error = |source: io::Error| BruteFirError::Connect {
            addr: self.addr.clone(),
            source,
        };

        let addr = self
            .addr
            .to_socket_addrs()
            .map_err(connect_error)?
            .next()
            .ok_or_else(|| {
                connect_error(io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
            })?;

        let stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(connect_error)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    /// Send one command line and collect the reply until the server closes
    pub fn send(&self, command: &str) -> Result<String, BruteFirError> {
        let mut stream = self.connect()?;
        stream.write_all(command.as_bytes())?;
        stream.flush()?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply)?;
        Ok(reply)
    }
}

fn is_rejection(reply: &str) -> bool {
    reply.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.contains("error") || line.contains("invalid") || line.contains("unknown")
    })
}

impl FilterEngine for BruteFir {
    #[instrument(skip(self))]
    fn change_filter_coefficients(&self, name: &str) -> phire_core::domain::error::Result<()> {
        let command = self.command(name);
        let reply = self.send(&command)?;

        if is_rejection(&reply) {
            warn!(coefficients = name, reply = reply.trim(), "Coefficient change rejected");
            return Err(BruteFirError::Rejected {
                command: command.trim().to_string(),
                reply: reply.trim().to_string(),
            }
            .into());
        }

        debug!(coefficients = name, "Filter coefficients changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_covers_every_filter() {
        let engine = BruteFir::new(
            "127.0.0.1",
            6556,
            vec!["left".to_string(), "right".to_string()],
            Duration::from_secs(1),
        );
        assert_eq!(
            engine.command("harman"),
            "cfc \"left\" \"harman\"; cfc \"right\" \"harman\"; quit;\n"
        );
    }

    #[test]
    fn test_rejection_detection() {
        assert!(is_rejection("Unknown coefficient set \"nope\".\n"));
        assert!(is_rejection("ERROR: invalid filter\n"));
        assert!(!is_rejection("\n"));
        assert!(!is_rejection("ok\n"));
    }
}
