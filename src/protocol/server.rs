use std::{
    io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    config::ServerConfig,
    service::Service,
    signal::{Shutdown, SignalError, SignalKind, SignalRoutes},
};

use super::{
    ThreadPool,
    connection::{Connection, ConnectionError},
    packet::{CodecError, Credentials, Operation, Packet, PacketKind, Payload, error_code},
    transport::{Family, Poller, Readiness, Socket, Timeout, TransportError},
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket setup failed: {0}")]
    Setup(#[source] TransportError),
    #[error("socket selecting failed: {0}")]
    Wait(#[source] TransportError),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Accept loop handing each connection to the worker pool.
///
/// Every connection carries one request; the task answering it decodes the packet, routes it
/// to the [`Service`] and sends back one reply.
pub struct Server<S: Service> {
    config: ServerConfig,
    kind: PacketKind,
    listener: Socket,
    address: SocketAddr,
    poller: Poller,
    pool: ThreadPool,
    service: Arc<S>,
    shutdown: Shutdown,
    signals: SignalRoutes,
}

impl<S: Service> Server<S> {
    /// Binds and listens with a backlog of `workers * backlog_multiplier`.
    pub fn bind(config: ServerConfig, service: S) -> Result<Self, ServerError> {
        let addr = SocketAddr::new(config.address, config.port);
        let mut listener = Socket::create(Family::of(&addr)).map_err(ServerError::Setup)?;
        listener
            .set_reuse_address(true)
            .and_then(|_| listener.set_nonblocking(true))
            .and_then(|_| listener.bind(addr))
            .and_then(|_| listener.listen(config.backlog()))
            .map_err(ServerError::Setup)?;
        let address = listener.local_addr().map_err(ServerError::Setup)?;

        let poller = Poller::new().map_err(ServerError::Setup)?;
        let shutdown = Shutdown::new();
        shutdown.attach(poller.canceller());

        let pool = ThreadPool::new(config.worker_count());
        info!(
            "listening at {address} with {} workers, backlog {}",
            pool.size(),
            config.backlog()
        );

        Ok(Self {
            kind: PacketKind::BASE,
            listener,
            address,
            poller,
            pool,
            service: Arc::new(service),
            signals: SignalRoutes::new(shutdown.clone()),
            shutdown,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Handle that stops the loop when requested.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Stops the loop when `kind` arrives. Routes are released when the server is dropped.
    pub fn connect_signal(&mut self, kind: SignalKind) -> Result<bool, ServerError> {
        Ok(self.signals.connect(kind)?)
    }

    /// Serves until shutdown, then drops queued connections and waits for running ones.
    pub fn run(mut self) -> Result<(), ServerError> {
        let timeout = Timeout::from_millis(self.config.poll_timeout_ms);
        let result = self.serve(timeout);

        self.pool.close(true, true);
        info!("server stopped");
        result
    }

    fn serve(&mut self, timeout: Timeout) -> Result<(), ServerError> {
        while !self.shutdown.is_requested() {
            debug!("waiting for connection");

            match self.poller.read_ready(&mut self.listener, timeout) {
                Ok(Readiness::Ready) => self.accept(),
                Ok(Readiness::Pending) => continue,
                Err(e) if self.shutdown.is_requested() => {
                    debug!("readiness wait ended by shutdown: {e}");
                    break;
                }
                Err(e) => {
                    error!("socket selecting failed: {}", self.listener.error_msg());
                    return Err(ServerError::Wait(e));
                }
            }
        }

        info!("leaving the server loop");
        Ok(())
    }

    fn accept(&mut self) {
        let mut socket = match self.listener.accept() {
            Ok(socket) => socket,
            Err(e) if e.io_kind() == Some(io::ErrorKind::WouldBlock) => return,
            Err(e) => {
                warn!("broken connection: {e}");
                return;
            }
        };

        if let Err(e) = socket.set_nonblocking(false).and_then(|_| {
            socket.set_timeouts(self.config.read_timeout(), self.config.write_timeout())
        }) {
            warn!("failed to configure accepted socket: {e}");
            return;
        }

        let connection = Connection::new(socket, self.kind);
        let service = Arc::clone(&self.service);
        debug!("add job to pool");
        if let Err(e) = self
            .pool
            .execute(move || run_task(connection, service.as_ref()))
        {
            warn!("dropping connection: {e}");
        }
    }
}

fn run_task(mut connection: Connection, service: &dyn Service) {
    if let Err(e) = handle_connection(&mut connection, service) {
        warn!("connection failed: {e}");
    }
    connection.close();
}

fn handle_connection(
    connection: &mut Connection,
    service: &dyn Service,
) -> Result<(), ConnectionError> {
    debug!("receiving socket data");
    let received = match connection.receive() {
        Err(ConnectionError::Codec(CodecError::UndecodableBody {
            kind,
            action,
            source,
        })) => {
            info!("received unknown packet, action {:#06x}: {source}", action.0);
            return connection.send(&Packet::error(
                kind,
                action.reply(),
                error_code::UNKNOWN_PACKET,
                "Unknown packet",
            ));
        }
        received => received?,
    };
    let Some(request) = received else {
        match connection.socket().error_msg() {
            msg if msg.is_empty() => info!("there is no data received"),
            msg => info!("no packet received: {msg}"),
        }
        return Ok(());
    };

    let (kind, action) = (request.kind, request.action);
    let reply = panic::catch_unwind(AssertUnwindSafe(|| {
        dispatch(connection.kind(), request, service)
    }))
    .unwrap_or_else(|_| {
        error!("service panicked while handling action {:#06x}", action.0);
        Packet::error(
            kind,
            action.reply(),
            error_code::SERVICE_FAILURE,
            "Service failure",
        )
    });

    match connection.send(&reply) {
        Err(ConnectionError::Codec(CodecError::PacketTooLarge { size })) => {
            warn!("reply of {size} bytes does not fit in a packet");
            connection.send(&Packet::error(
                kind,
                action.reply(),
                error_code::REPLY_TOO_LARGE,
                format!("Reply of {size} bytes is too large"),
            ))
        }
        sent => sent,
    }
}

/// Routes one request to `service` and builds the reply.
///
/// Requests outside the `kind` namespace, replies, and unknown (payload type, operation)
/// pairs get an ERROR reply saying "Unknown packet".
pub fn dispatch(kind: PacketKind, request: Packet, service: &dyn Service) -> Packet {
    let action = request.action;
    let operation = if request.kind == kind && !action.is_reply() {
        action.operation()
    } else {
        None
    };

    let payload = match (operation, request.payload) {
        (Some(Operation::Ping), Payload::Binary(data)) => {
            <[u8; 8]>::try_from(data.as_slice()).ok().map(|bytes| {
                let value = service.ping(u64::from_le_bytes(bytes));
                Payload::Binary(value.to_le_bytes().to_vec())
            })
        }
        (Some(Operation::CheckCredentials), Payload::Binary(data)) => {
            Credentials::from_bytes(&data).ok().map(|credentials| {
                if service.check_credentials(&credentials.login, &credentials.password) {
                    Payload::None
                } else {
                    info!("credentials rejected for login '{}'", credentials.login);
                    Payload::Error {
                        code: error_code::INVALID_CREDENTIALS,
                        message: "Invalid login or password".to_string(),
                    }
                }
            })
        }
        (Some(Operation::Echo), Payload::Text(text)) => {
            debug!("received text: {text}");
            Some(Payload::Text(service.echo(&text)))
        }
        (Some(Operation::Time), Payload::None) => {
            let now = service.get_time();
            Some(Payload::Binary(now.timestamp().to_le_bytes().to_vec()))
        }
        (Some(Operation::ExecCommand), Payload::Text(command)) => {
            Some(Payload::Text(service.execute_command(&command)))
        }
        (Some(Operation::Calculate), Payload::Text(input)) => {
            Some(Payload::Text(service.calculate(&input)))
        }
        _ => None,
    };

    match payload {
        Some(payload) => Packet::new(request.kind, action.reply(), payload),
        None => {
            info!("received unknown packet, action {:#06x}", action.0);
            Packet::error(
                request.kind,
                action.reply(),
                error_code::UNKNOWN_PACKET,
                "Unknown packet",
            )
        }
    }
}
