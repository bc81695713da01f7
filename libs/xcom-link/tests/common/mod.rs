//! In-process fake Xcom gateway for link tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use xcom_protocol::{
    Datapoint, Frame, FrameBuffer, Inbound, XcomDataset, XcomFormat, XcomLevel,
};

/// Byte chunks written back for one received frame
pub type Reply = Vec<Vec<u8>>;

/// How replies are put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Whole,
    /// One byte per write with a pause, to force partial reads
    ByteAtATime,
}

pub struct FakeGateway {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Frame>>>,
    task: JoinHandle<()>,
}

impl FakeGateway {
    /// Listen on an ephemeral port and serve the first connection
    pub async fn start<F>(responder: F) -> Self
    where
        F: FnMut(&Frame) -> Reply + Send + 'static,
    {
        Self::start_with(Delivery::Whole, responder).await
    }

    pub async fn start_with<F>(delivery: Delivery, responder: F) -> Self
    where
        F: FnMut(&Frame) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve(stream, delivery, responder, log).await;
        });

        Self {
            addr,
            received,
            task,
        }
    }

    /// Dial a link that listens on `addr`, retrying until it is up
    pub async fn dial<F>(addr: SocketAddr, responder: F) -> Self
    where
        F: FnMut(&Frame) -> Reply + Send + 'static,
    {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let task = tokio::spawn(async move {
            let stream = loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            serve(stream, Delivery::Whole, responder, log).await;
        });

        Self {
            addr,
            received,
            task,
        }
    }

    /// Frames received so far, in arrival order
    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().clone()
    }

    /// Drop the connection as a crashed gateway would
    pub fn kill(&self) {
        self.task.abort();
    }
}

impl Drop for FakeGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<F>(
    mut stream: TcpStream,
    delivery: Delivery,
    mut responder: F,
    received: Arc<Mutex<Vec<Frame>>>,
) where
    F: FnMut(&Frame) -> Reply + Send + 'static,
{
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 512];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for item in frames.push(&buf[..n]) {
            let Inbound::Frame(frame) = item else {
                continue;
            };
            received.lock().push(frame.clone());

            for chunk in responder(&frame) {
                let written = match delivery {
                    Delivery::Whole => stream.write_all(&chunk).await,
                    Delivery::ByteAtATime => write_slowly(&mut stream, &chunk).await,
                };
                if written.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_slowly(stream: &mut TcpStream, chunk: &[u8]) -> std::io::Result<()> {
    for byte in chunk {
        stream.write_all(std::slice::from_ref(byte)).await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(())
}

/// Encoded frame as one reply chunk
pub fn wire(frame: &Frame) -> Vec<u8> {
    frame.encode().unwrap().to_vec()
}

/// Answer every read with `payload`
pub fn answer(frame: &Frame, payload: Vec<u8>) -> Reply {
    vec![wire(&frame.response(frame.service, payload))]
}

/// Small catalog covering the scenarios under test
pub fn catalog() -> Arc<XcomDataset> {
    Arc::new(XcomDataset::new(vec![
        Datapoint::new("xt", 3000, XcomLevel::Info, XcomFormat::Float).with_name("Battery voltage"),
        Datapoint::new("xt", 3023, XcomLevel::Info, XcomFormat::Int32).with_name("Output power"),
        Datapoint::new("xt", 3028, XcomLevel::Info, XcomFormat::ShortEnum).with_name("Operating state"),
        Datapoint::new("xt", 3049, XcomLevel::Info, XcomFormat::ShortEnum).with_name("State of inverter"),
        Datapoint::new("xt", 1100, XcomLevel::Basic, XcomFormat::Menu).with_name("Basic settings"),
        Datapoint::new("xt", 1107, XcomLevel::Basic, XcomFormat::Float)
            .with_name("Maximum current of AC source")
            .with_parent(1100),
        Datapoint::new("xt", 1126, XcomLevel::Basic, XcomFormat::Bool)
            .with_name("Smart boost allowed")
            .with_parent(1100),
        Datapoint::new("xt", 1200, XcomLevel::Expert, XcomFormat::Menu).with_name("Auxiliary contact 1"),
        Datapoint::new("xt", 1201, XcomLevel::Expert, XcomFormat::LongEnum)
            .with_name("Operating mode (AUX 1)")
            .with_parent(1200),
        Datapoint::new("xt", 1138, XcomLevel::Expert, XcomFormat::Format)
            .with_name("Battery charge current")
            .with_scale(10.0),
    ]))
}
