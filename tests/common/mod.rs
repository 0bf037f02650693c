#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// How long a stalled response holds back its body after the header.
pub const STALL: Duration = Duration::from_millis(600);

/// Routes driver logs to the test output; `RUST_LOG=debug` shows every read.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Shared {
    holding: Mutex<HashMap<u16, u16>>,
    input: Mutex<HashMap<u16, u16>>,
    requests: AtomicUsize,
    open: AtomicUsize,
    stalls: AtomicUsize,
}

/// Minimal Modbus TCP slave serving function codes 0x03 and 0x04.
pub struct Simulator {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Simulator {
    pub async fn start(unit_id: u8) -> Simulator {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        let connections = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let shared = shared.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    shared.open.fetch_add(1, Ordering::SeqCst);
                    let task = tokio::spawn(serve(stream, unit_id, shared.clone()));
                    connections.lock().push(task);
                }
            })
        };

        Simulator {
            addr,
            shared,
            handle,
            connections,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_holding(&self, start: u16, words: &[u16]) {
        let mut bank = self.shared.holding.lock();
        for (i, word) in words.iter().enumerate() {
            bank.insert(start + i as u16, *word);
        }
    }

    pub fn set_input(&self, start: u16, words: &[u16]) {
        let mut bank = self.shared.input.lock();
        for (i, word) in words.iter().enumerate() {
            bank.insert(start + i as u16, *word);
        }
    }

    /// Requests answered so far, across all connections.
    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Client connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// The next `count` responses send their header, then wait `STALL`
    /// before sending the rest of the frame.
    pub fn stall_responses(&self, count: usize) {
        self.shared.stalls.store(count, Ordering::SeqCst);
    }

    /// Waits until no client connection is open, or `limit` passes.
    pub async fn wait_until_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.open_connections() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.handle.abort();
        for task in self.connections.lock().drain(..) {
            task.abort();
        }
    }
}

/// Counts a served connection as closed however its task ends.
struct OpenConnection(Arc<Shared>);

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve(mut stream: TcpStream, unit_id: u8, shared: Arc<Shared>) {
    let _open = OpenConnection(shared.clone());
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        shared.requests.fetch_add(1, Ordering::SeqCst);

        let response_pdu = answer(&pdu, &shared);
        let mut frame = Vec::with_capacity(7 + response_pdu.len());
        frame.extend_from_slice(&header[0..4]);
        frame.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(&response_pdu);

        let stalled = shared
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            if stream.write_all(&frame[..7]).await.is_err() {
                return;
            }
            tokio::time::sleep(STALL).await;
            if stream.write_all(&frame[7..]).await.is_err() {
                return;
            }
        } else if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn answer(pdu: &[u8], shared: &Shared) -> Vec<u8> {
    let function = pdu[0];
    let bank = match function {
        0x03 => shared.holding.lock(),
        0x04 => shared.input.lock(),
        _ => return vec![function | 0x80, 0x01],
    };
    let start = u16::from_be_bytes([pdu[1], pdu[2]]);
    let count = u16::from_be_bytes([pdu[3], pdu[4]]);

    let words: Option<Vec<u16>> = (start..start + count).map(|a| bank.get(&a).copied()).collect();
    match words {
        Some(words) => {
            let mut out = vec![function, (words.len() * 2) as u8];
            for word in words {
                out.extend_from_slice(&word.to_be_bytes());
            }
            out
        }
        None => vec![function | 0x80, 0x02],
    }
}
