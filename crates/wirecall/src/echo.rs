//! A ready-made echo operation, used by the CLI and the integration tests.

use bytes::{BufMut, Bytes, BytesMut};
use wirecall_server::{Result as ServeResult, Service};
use wirecall_wire::{IoVector, Message, Operation, Result as WireResult, WireError};

/// Echo request and response: a sequence number plus an arbitrary payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EchoMessage {
    pub seq: u64,
    pub payload: Bytes,
}

impl Message for EchoMessage {
    // seq (8B) + payload length (8B)
    const FIXED_SIZE: usize = 16;

    fn encode_fixed(&self, dst: &mut BytesMut) {
        dst.put_u64_le(self.seq);
        dst.put_u64_le(self.payload.len() as u64);
    }

    fn variable_parts(&self) -> Vec<&[u8]> {
        vec![&self.payload]
    }

    fn decode(fixed: &[u8], variable: Bytes) -> WireResult<Self> {
        let seq = u64::from_le_bytes(fixed[0..8].try_into().expect("8-byte field"));
        let len = u64::from_le_bytes(fixed[8..16].try_into().expect("8-byte field")) as usize;
        if variable.len() < len {
            return Err(WireError::Decode("payload length exceeds variable section"));
        }
        Ok(Self {
            seq,
            payload: variable.slice(..len),
        })
    }
}

/// The echo operation: the response mirrors the request.
pub enum Echo {}

impl Operation for Echo {
    const INTERFACE: u32 = 1;
    const METHOD: u32 = 1;
    type Request = EchoMessage;
    type Response = EchoMessage;
}

/// Server-side echo handler.
pub struct EchoService;

impl Service<Echo> for EchoService {
    fn handle(&self, request: EchoMessage, _buf: &mut IoVector<'static>) -> ServeResult<EchoMessage> {
        Ok(request)
    }
}
