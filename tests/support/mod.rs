//! Minimal Modbus/TCP server for exercising the power-meter poller against a
//! real socket. Serves input registers only; everything else answers with an
//! IllegalFunction exception.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

const FC_READ_INPUT_REGISTERS: u8 = 0x04;
const EX_ILLEGAL_FUNCTION: u8 = 0x01;
const EX_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

pub struct MockPowerMeter {
    input_registers: Arc<RwLock<HashMap<u16, u16>>>,
    /// When set, the next accepted request gets its connection dropped
    /// instead of an answer.
    drop_next_request: Arc<RwLock<bool>>,
}

impl MockPowerMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            input_registers: Arc::new(RwLock::new(HashMap::new())),
            drop_next_request: Arc::new(RwLock::new(false)),
        })
    }

    /// Bind on an ephemeral port and serve connections until the test ends.
    pub async fn start(self: &Arc<Self>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let _ = server.handle_connection(stream).await;
                });
            }
        });
        addr
    }

    /// Publish a float value as a big-endian (ABCD) register pair.
    pub async fn set_float_abcd(&self, start_addr: u16, value: f32) {
        let bits = value.to_bits();
        let mut registers = self.input_registers.write().await;
        registers.insert(start_addr, (bits >> 16) as u16);
        registers.insert(start_addr + 1, bits as u16);
    }

    pub async fn drop_next_request(&self) {
        *self.drop_next_request.write().await = true;
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut header = [0u8; 7];
        loop {
            if stream.read_exact(&mut header).await.is_err() {
                return Ok(()); // client went away
            }
            let tid = u16::from_be_bytes([header[0], header[1]]);
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let uid = header[6];

            let mut pdu = vec![0u8; len.saturating_sub(1)];
            stream.read_exact(&mut pdu).await?;

            if *self.drop_next_request.read().await {
                *self.drop_next_request.write().await = false;
                return Ok(()); // simulate a dying connection
            }

            let response = self.build_response(&pdu).await;
            let mut packet = Vec::with_capacity(7 + response.len());
            packet.extend_from_slice(&tid.to_be_bytes());
            packet.extend_from_slice(&[0, 0]); // protocol id
            packet.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
            packet.push(uid);
            packet.extend_from_slice(&response);
            stream.write_all(&packet).await?;
        }
    }

    async fn build_response(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 || pdu[0] != FC_READ_INPUT_REGISTERS {
            return vec![pdu.first().copied().unwrap_or(0) | 0x80, EX_ILLEGAL_FUNCTION];
        }

        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let count = u16::from_be_bytes([pdu[3], pdu[4]]);
        let registers = self.input_registers.read().await;

        let mut values = Vec::with_capacity(count as usize);
        for offset in 0..count {
            match registers.get(&(start + offset)) {
                Some(value) => values.push(*value),
                None => return vec![FC_READ_INPUT_REGISTERS | 0x80, EX_ILLEGAL_DATA_ADDRESS],
            }
        }

        let mut response = vec![FC_READ_INPUT_REGISTERS, (values.len() * 2) as u8];
        for value in values {
            response.extend_from_slice(&value.to_be_bytes());
        }
        response
    }
}
