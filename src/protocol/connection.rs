use log::trace;
use thiserror::Error;

use super::{
    packet::{Action, CodecError, Operation, Packet, PacketKind, Payload, PayloadType},
    transport::{Socket, TransportError},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    NoReply(String),
    #[error("{message}")]
    Remote { code: u32, message: String },
    #[error("Unknown packet")]
    UnknownPacket,
}

/// A socket plus the packet kind namespace used to validate what arrives on it.
///
/// Carries one request and one reply, then gets closed.
#[derive(Debug)]
pub struct Connection {
    socket: Socket,
    kind: PacketKind,
}

impl Connection {
    pub fn new(socket: Socket, kind: PacketKind) -> Self {
        Self { socket, kind }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn send(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let bytes = packet.encode()?;
        trace!("sending {} byte packet", bytes.len());
        self.socket.send(&bytes)?;
        Ok(())
    }

    /// Reads one packet; `None` when the peer went away before sending one.
    pub fn receive(&mut self) -> Result<Option<Packet>, ConnectionError> {
        Ok(Packet::read_from(&mut self.socket)?)
    }

    pub fn request(&mut self, op: Operation, payload: Payload) -> Result<(), ConnectionError> {
        let packet = Packet::new(self.kind, Action::request(op), payload);
        self.send(&packet)
    }

    /// Waits for the reply to `op` and checks it carries `payload_type`.
    ///
    /// An ERROR packet in our namespace becomes [`ConnectionError::Remote`]; anything else that
    /// does not match kind, payload type and reply action is an unknown packet.
    pub fn receive_reply(
        &mut self,
        op: Operation,
        payload_type: PayloadType,
    ) -> Result<Packet, ConnectionError> {
        let Some(packet) = self.receive()? else {
            let reason = match self.socket.error_msg() {
                msg if msg.is_empty() => "Error receiving packet".to_string(),
                msg => msg,
            };
            return Err(ConnectionError::NoReply(reason));
        };

        if packet.kind == self.kind {
            if let Some((code, message)) = packet.as_error() {
                return Err(ConnectionError::Remote {
                    code,
                    message: message.to_string(),
                });
            }
        }

        if !packet.matches(self.kind, payload_type, Action::request(op).reply()) {
            return Err(ConnectionError::UnknownPacket);
        }
        Ok(packet)
    }

    pub fn close(&mut self) {
        self.socket.close();
    }
}
