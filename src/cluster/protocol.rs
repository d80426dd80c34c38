//! Cluster Protocol Messages
//!
//! Binary protocol spoken over peer TCP connections. Each frame is a
//! 4-byte big-endian length followed by a bincode-encoded message.

use bincode::{Decode, Encode};
use bytes::{Buf, BytesMut};

use super::rpc::{RemoteOp, RemoteReply};
use super::CoordinatorError;

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 2;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Handshake acknowledgment
    HelloAck { node_id: String, version: u8 },

    /// Operation to run on the receiving node
    Request { request_id: u64, op: RemoteOp },

    /// Result of an earlier request on the same connection
    Response {
        request_id: u64,
        reply: RemoteReply,
    },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Request { .. } => "Request",
            ClusterMessage::Response { .. } => "Response",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Take one complete message off the front of `buf`, if there is one
pub fn take_frame(buf: &mut BytesMut) -> Result<Option<ClusterMessage>, CoordinatorError> {
    let Some(len) = read_frame_length(buf) else {
        return Ok(None);
    };
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(CoordinatorError::Codec(format!("frame of {} bytes", len)));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    let payload = buf.split_to(len);
    Ok(Some(ClusterMessage::decode(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::rpc::KvRequest;
    use crate::cluster::RecordKey;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_decode_hello() {
        let msg = ClusterMessage::Hello {
            node_id: "node1".to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };

        let encoded = msg.encode().unwrap();
        let decoded = ClusterMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_frame_message() {
        let msg = ClusterMessage::Ping;
        let frame = frame_message(&msg).unwrap();

        let len = read_frame_length(&frame).unwrap();
        assert_eq!(len as usize, frame.len() - 4);

        let decoded = ClusterMessage::decode(&frame[4..]).unwrap();
        assert!(matches!(decoded, ClusterMessage::Ping));
    }

    #[test]
    fn test_take_frame_handles_partial_and_pipelined() {
        let request = ClusterMessage::Request {
            request_id: 7,
            op: RemoteOp::Kv(KvRequest::Get(RecordKey::session("c"))),
        };
        let mut bytes = frame_message(&request).unwrap();
        bytes.extend(frame_message(&ClusterMessage::Pong).unwrap());

        let mut buf = BytesMut::from(&bytes[..3]);
        assert_eq!(take_frame(&mut buf).unwrap(), None);

        buf.extend_from_slice(&bytes[3..]);
        assert_eq!(take_frame(&mut buf).unwrap(), Some(request));
        assert_eq!(take_frame(&mut buf).unwrap(), Some(ClusterMessage::Pong));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::from(&u32::MAX.to_be_bytes()[..]);
        assert!(matches!(
            take_frame(&mut buf),
            Err(CoordinatorError::Codec(_))
        ));
    }

    #[test]
    fn test_type_name() {
        assert_eq!(ClusterMessage::Ping.type_name(), "Ping");
        assert_eq!(ClusterMessage::Goodbye.type_name(), "Goodbye");
    }
}
