//! A [`Binding`] to a data source speaking newline-delimited JSON over TCP.
//!
//! On bind: connect, send `register_callback`, then start a reader task that
//! turns every inbound line into a [`BindingEvent`]. EOF becomes
//! `Disconnected`; a read error becomes `BindingDied`. `fetch_latest` sends
//! `get_latest` and lets the answer arrive as an ordinary push.

use std::time::Duration;

use bg_protocol::{BgRecord, CallbackRegistration, SourceMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::binding::{BindError, Binding, BindingEvent, EventSink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpSource {
    address: String,
    client_id: String,
    writer: Option<OwnedWriteHalf>,
    reader_task: Option<JoinHandle<()>>,
}

impl TcpSource {
    pub fn new(address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client_id: client_id.into(),
            writer: None,
            reader_task: None,
        }
    }

    fn registration(&self) -> CallbackRegistration {
        CallbackRegistration {
            client_id: self.client_id.clone(),
        }
    }

    async fn send(&mut self, msg: &SourceMessage) -> Result<(), BindError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BindError::Transport("not connected".to_owned()))?;
        let line = msg
            .to_line()
            .map_err(|e| BindError::Transport(e.to_string()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BindError::Transport(e.to_string()))
    }
}

impl Binding for TcpSource {
    async fn bind(&mut self, sink: EventSink) -> Result<(), BindError> {
        // Rebinding always starts from a clean slate.
        self.unbind().await;

        info!(address = %self.address, "connecting to data source");
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(BindError::from_connect_error(&e)),
            Err(_) => {
                return Err(BindError::TargetAbsent(format!(
                    "no answer from {} within {}s",
                    self.address,
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        };
        let (read, write) = stream.into_split();
        self.writer = Some(write);

        let register = SourceMessage::RegisterCallback(self.registration());
        if let Err(e) = self.send(&register).await {
            self.writer = None;
            return Err(BindError::Registration(e.to_string()));
        }

        self.reader_task = Some(tokio::spawn(read_lines(read, sink)));
        Ok(())
    }

    async fn fetch_latest(&mut self) -> Result<Option<BgRecord>, BindError> {
        self.send(&SourceMessage::GetLatest).await?;
        Ok(None)
    }

    async fn unbind(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if self.writer.is_some() {
            let unregister = SourceMessage::UnregisterCallback(self.registration());
            if let Err(e) = self.send(&unregister).await {
                debug!(error = %e, "unregister not delivered");
            }
            if let Some(mut writer) = self.writer.take() {
                let _ = writer.shutdown().await;
            }
        }
    }
}

async fn read_lines(read: OwnedReadHalf, sink: EventSink) {
    let mut reader = BufReader::new(read);
    let mut line_buf = String::new();

    loop {
        line_buf.clear();
        let event = match reader.read_line(&mut line_buf).await {
            Ok(0) => {
                info!("data source closed the connection");
                sink.deliver(BindingEvent::Disconnected).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "data source read error");
                sink.deliver(BindingEvent::BindingDied(e.to_string())).await;
                return;
            }
            Ok(_) => {
                let raw_line = line_buf.trim_end_matches(['\r', '\n']);
                if raw_line.trim().is_empty() {
                    continue;
                }
                match SourceMessage::from_line(raw_line) {
                    Ok(SourceMessage::BgData(record)) => BindingEvent::Record(record),
                    Ok(SourceMessage::Heartbeat(hb)) => BindingEvent::Heartbeat {
                        timestamp: hb.timestamp,
                    },
                    Ok(other) => {
                        debug!(message = ?other, "ignoring unexpected message from data source");
                        continue;
                    }
                    Err(e) => BindingEvent::Malformed(format!("{e}: {raw_line}")),
                }
            }
        };
        if !sink.deliver(event).await {
            return;
        }
    }
}
