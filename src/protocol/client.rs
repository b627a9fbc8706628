use std::{io, thread, time::Duration};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use thiserror::Error;

use crate::config::ClientConfig;

use super::{
    connection::{Connection, ConnectionError},
    packet::{CodecError, Credentials, Operation, Packet, PacketKind, Payload, PayloadType},
    transport::{Family, Socket, TransportError, resolve},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[source] TransportError),
    #[error("server refused {attempts} connection attempts")]
    Exhausted { attempts: u32 },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("authentication failed: {message}")]
    AuthenticationFailed { code: u32, message: String },
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        ClientError::Connection(e.into())
    }
}

/// Connects to `host:port`, retrying while the server refuses connections.
///
/// Every resolved address is tried in turn. Refusal means the accept queue is full, so a round
/// where some address refused is retried after `retry_delay`. A round where every address failed
/// some other way is fatal.
pub fn connect(
    host: &str,
    port: u16,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<Socket, ClientError> {
    let addrs = resolve(host, port).map_err(ClientError::Connect)?;
    let attempts = max_attempts.max(1);

    for attempt in 1..=attempts {
        let mut refused = false;
        let mut fatal = None;

        for addr in &addrs {
            let result = Socket::create(Family::of(addr)).and_then(|mut socket| {
                socket.connect(*addr)?;
                Ok(socket)
            });
            match result {
                Ok(socket) => {
                    debug!("connected to {addr} on attempt {attempt}");
                    return Ok(socket);
                }
                Err(e) if e.io_kind() == Some(io::ErrorKind::ConnectionRefused) => {
                    debug!("connection to {addr} refused");
                    refused = true;
                }
                Err(e) => {
                    debug!("connection to {addr} failed: {e}");
                    fatal.get_or_insert(e);
                }
            }
        }

        if !refused {
            if let Some(e) = fatal {
                return Err(ClientError::Connect(e));
            }
        }

        if attempt < attempts {
            thread::sleep(retry_delay);
        }
    }

    warn!("giving up on {host}:{port} after {attempts} attempts");
    Err(ClientError::Exhausted { attempts })
}

/// One synchronous call per method; every call opens and closes its own connection.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
    kind: PacketKind,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            kind: PacketKind::BASE,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn open(&self) -> Result<Connection, ClientError> {
        let mut socket = connect(
            &self.config.host,
            self.config.port,
            self.config.connect_attempts,
            self.config.retry_delay(),
        )?;
        socket
            .set_timeouts(self.config.read_timeout(), self.config.write_timeout())
            .map_err(ClientError::Connect)?;

        Ok(Connection::new(socket, self.kind))
    }

    fn call(
        &self,
        op: Operation,
        payload: Payload,
        reply_type: PayloadType,
    ) -> Result<Packet, ClientError> {
        let mut connection = self.open()?;
        let reply = connection
            .request(op, payload)
            .and_then(|_| connection.receive_reply(op, reply_type));
        connection.close();

        Ok(reply?)
    }

    fn call_text(&self, op: Operation, text: &str) -> Result<String, ClientError> {
        let reply = self.call(op, Payload::Text(text.to_string()), PayloadType::Text)?;
        reply
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| ClientError::InvalidReply("expected text".to_string()))
    }

    fn call_binary8(&self, op: Operation, payload: Payload) -> Result<[u8; 8], ClientError> {
        let reply = self.call(op, payload, PayloadType::Binary)?;
        let data = reply.as_binary().unwrap_or_default();
        data.try_into()
            .map_err(|_| ClientError::InvalidReply(format!("expected 8 bytes, got {}", data.len())))
    }

    /// Sends `value` and returns what came back; callers compare the two.
    pub fn ping(&self, value: u64) -> Result<u64, ClientError> {
        let payload = Payload::Binary(value.to_le_bytes().to_vec());
        Ok(u64::from_le_bytes(self.call_binary8(Operation::Ping, payload)?))
    }

    pub fn sendmsg(&self, text: &str) -> Result<String, ClientError> {
        self.call_text(Operation::Echo, text)
    }

    pub fn gettime(&self) -> Result<DateTime<Utc>, ClientError> {
        let secs = i64::from_le_bytes(self.call_binary8(Operation::Time, Payload::None)?);
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| ClientError::InvalidReply(format!("timestamp {secs} out of range")))
    }

    pub fn execmd(&self, command: &str) -> Result<String, ClientError> {
        self.call_text(Operation::ExecCommand, command)
    }

    pub fn calculate(&self, expression: &str) -> Result<String, ClientError> {
        self.call_text(Operation::Calculate, expression)
    }

    /// Checks the login and password from the configuration.
    pub fn authenticate(&self) -> Result<(), ClientError> {
        self.check_credentials(&self.config.login, &self.config.password)
    }

    /// Succeeds on an empty reply; an ERROR reply is an authentication failure.
    pub fn check_credentials(&self, login: &str, password: &str) -> Result<(), ClientError> {
        let data = Credentials::new(login, password).to_bytes()?;

        match self.call(
            Operation::CheckCredentials,
            Payload::Binary(data),
            PayloadType::None,
        ) {
            Ok(_) => Ok(()),
            Err(ClientError::Connection(ConnectionError::Remote { code, message })) => {
                Err(ClientError::AuthenticationFailed { code, message })
            }
            Err(e) => Err(e),
        }
    }
}
