//! Scripted stand-ins for the replication connection and the decoder
//! collaborators, for driving the fetch loop without a server, and a
//! scripted TCP backend for exercising the wire client.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::{ReplicationTransport, StreamFrame};
use super::protocol::StandbyStatusUpdate;
use crate::decode::{Classify, Decoder, MessageClass, SchemaLoader};
use crate::{Error, Result};

pub enum Step {
    Frame(StreamFrame),
    Fail(Error),
}

/// Builds the sequence of frames a mock server sends.
#[derive(Default)]
pub struct WalScript {
    steps: Vec<Step>,
}

impl WalScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keepalive(mut self, wal_end: u64, reply_requested: bool) -> Self {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(wal_end);
        buf.put_i64(0);
        buf.put_u8(u8::from(reply_requested));
        self.steps.push(Step::Frame(StreamFrame::CopyData(buf.freeze())));
        self
    }

    /// A WAL record starting at `wal_start` whose plugin payload is `payload`.
    /// See [`MockDecoder`] for how payloads are interpreted.
    pub fn wal(mut self, wal_start: u64, payload: &str) -> Self {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(wal_start);
        buf.put_u64(wal_start.wrapping_add(payload.len() as u64));
        buf.put_i64(0);
        buf.put_slice(payload.as_bytes());
        self.steps.push(Step::Frame(StreamFrame::CopyData(buf.freeze())));
        self
    }

    pub fn frame(mut self, frame: StreamFrame) -> Self {
        self.steps.push(Step::Frame(frame));
        self
    }

    pub fn fail(mut self, error: Error) -> Self {
        self.steps.push(Step::Fail(error));
        self
    }

    pub fn build(self) -> VecDeque<Step> {
        self.steps.into()
    }
}

#[derive(Default)]
struct RecorderState {
    statuses: Vec<(Instant, StandbyStatusUpdate)>,
    closes: usize,
    recvs: usize,
    exhausted: bool,
}

/// Observes what the fetch loop did to a [`MockTransport`].
#[derive(Clone, Default)]
pub struct TransportRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl TransportRecorder {
    pub fn statuses(&self) -> Vec<(Instant, StandbyStatusUpdate)> {
        self.state.lock().unwrap().statuses.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn recv_count(&self) -> usize {
        self.state.lock().unwrap().recvs
    }

    /// True once the loop asked for a frame after the script ran out.
    pub fn exhausted(&self) -> bool {
        self.state.lock().unwrap().exhausted
    }
}

/// Plays a [`WalScript`], then stays silent forever.
pub struct MockTransport {
    script: VecDeque<Step>,
    recorder: TransportRecorder,
}

impl MockTransport {
    pub fn new(script: VecDeque<Step>) -> Self {
        Self {
            script,
            recorder: TransportRecorder::default(),
        }
    }

    pub fn recorder(&self) -> TransportRecorder {
        self.recorder.clone()
    }
}

#[async_trait]
impl ReplicationTransport for MockTransport {
    async fn recv(&mut self) -> Result<StreamFrame> {
        let step = {
            let mut state = self.recorder.state.lock().unwrap();
            state.recvs += 1;
            let step = self.script.pop_front();
            if step.is_none() {
                state.exhausted = true;
            }
            step
        };
        match step {
            Some(Step::Frame(frame)) => Ok(frame),
            Some(Step::Fail(error)) => Err(error),
            None => std::future::pending().await,
        }
    }

    async fn send_status(&mut self, update: &StandbyStatusUpdate) -> Result<()> {
        self.recorder
            .state
            .lock()
            .unwrap()
            .statuses
            .push((Instant::now(), *update));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.recorder.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Shared, ordered record of decoder and schema loader calls.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub label: String,
    pub class: MessageClass,
    /// Schema version in effect when the message was decoded.
    pub schema_version: u32,
}

impl Classify for MockMessage {
    fn class(&self) -> MessageClass {
        self.class
    }
}

/// Bumps a shared schema version on every refresh.
pub struct MockSchemaLoader {
    log: EventLog,
    version: Arc<AtomicU32>,
    fail: bool,
}

impl MockSchemaLoader {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            version: Arc::new(AtomicU32::new(0)),
            fail: false,
        }
    }

    pub fn failing(mut self, fail: bool) -> Self {
        self.fail = fail;
        self
    }

    pub fn version(&self) -> Arc<AtomicU32> {
        self.version.clone()
    }
}

#[async_trait]
impl SchemaLoader for MockSchemaLoader {
    async fn refresh_type(&mut self) -> Result<()> {
        if self.fail {
            return Err(Error::Connection("control connection lost".to_string()));
        }
        self.log.push("refresh");
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Interprets text payloads:
///
/// - `begin:<micros>` begins a transaction committed at `<micros>`
/// - `insert:<x>` a forwarded row change
/// - `ddl:<x>` a forwarded DDL change
/// - `ddl-ignore:<x>` a DDL change that is not forwarded
/// - `ignore:<x>` an ignorable row change
/// - `none` filtered by the decoder
/// - `fail` a decode error
/// - anything else is a plain marker such as a commit
pub struct MockDecoder {
    log: EventLog,
    schema_version: Arc<AtomicU32>,
}

impl MockDecoder {
    pub fn new(log: EventLog, schema_version: Arc<AtomicU32>) -> Self {
        Self {
            log,
            schema_version,
        }
    }
}

impl Decoder for MockDecoder {
    type Message = MockMessage;

    fn decode(&mut self, data: &[u8]) -> Result<Option<MockMessage>> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.log.push(format!("decode {}", text));

        let class = if let Some(micros) = text.strip_prefix("begin:") {
            let commit_time = micros
                .parse()
                .map_err(|_| Error::Decode(format!("bad commit time: {}", micros)))?;
            MessageClass::Begin { commit_time }
        } else if text.starts_with("insert:") {
            MessageClass::Change {
                ignore: false,
                ddl: false,
            }
        } else if text.starts_with("ddl:") {
            MessageClass::Change {
                ignore: false,
                ddl: true,
            }
        } else if text.starts_with("ddl-ignore:") {
            MessageClass::Change {
                ignore: true,
                ddl: true,
            }
        } else if text.starts_with("ignore:") {
            MessageClass::Change {
                ignore: true,
                ddl: false,
            }
        } else if text == "none" {
            return Ok(None);
        } else if text == "fail" {
            return Err(Error::Decode("malformed payload".to_string()));
        } else {
            MessageClass::Other
        };

        Ok(Some(MockMessage {
            label: text,
            class,
            schema_version: self.schema_version.load(Ordering::SeqCst),
        }))
    }
}

/// Accepts one connection on a local port and runs `script` against it.
///
/// Returns a key/value connection string for the port and the script's
/// task. Assertions inside the script surface when the task is awaited.
pub async fn fake_backend<F, Fut>(script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(FakeBackend) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(FakeBackend { stream }).await;
    });
    let conn_str = format!(
        "host=127.0.0.1 port={} user=capture dbname=app sslmode=disable",
        port
    );
    (conn_str, task)
}

/// Server side of one frontend connection. Messages are written by hand so
/// tests control framing down to the byte.
pub struct FakeBackend {
    stream: TcpStream,
}

impl FakeBackend {
    /// Reads the startup packet and returns its parameters.
    pub async fn read_startup(&mut self) -> Vec<(String, String)> {
        let len = self.stream.read_i32().await.unwrap();
        let mut body = vec![0; len as usize - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body[..4], &196608i32.to_be_bytes(), "protocol 3.0");

        let mut fields = body[4..]
            .split(|b| *b == 0)
            .map(|f| String::from_utf8_lossy(f).into_owned());
        let mut params = Vec::new();
        while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
            if key.is_empty() {
                break;
            }
            params.push((key, value));
        }
        params
    }

    /// Startup with trust authentication.
    pub async fn accept_startup(&mut self) -> Vec<(String, String)> {
        let params = self.read_startup().await;
        self.auth_ok().await;
        self.ready().await;
        params
    }

    /// Next tagged frontend message, or `None` once the client hung up.
    pub async fn read_message(&mut self) -> Option<(u8, Bytes)> {
        let tag = match self.stream.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return None,
            Err(e) => panic!("read failed: {}", e),
        };
        let len = self.stream.read_i32().await.unwrap();
        let mut body = vec![0; len as usize - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        Some((tag, body.into()))
    }

    /// Reads a simple query and returns its text.
    pub async fn expect_query(&mut self) -> String {
        let (tag, body) = self.read_message().await.expect("query");
        assert_eq!(tag, b'Q');
        String::from_utf8_lossy(body.strip_suffix(&[0]).unwrap_or(&body)).into_owned()
    }

    /// Drains messages until the client closes the socket and returns
    /// their tags.
    pub async fn expect_closed(&mut self) -> Vec<u8> {
        let mut tags = Vec::new();
        let drain = async {
            while let Some((tag, _)) = self.read_message().await {
                tags.push(tag);
            }
        };
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .expect("client did not close the connection");
        tags
    }

    pub async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut buf = BytesMut::with_capacity(5 + body.len());
        buf.put_u8(tag);
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);
        self.send_raw(&buf).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn auth_ok(&mut self) {
        self.send(b'R', &0i32.to_be_bytes()).await;
    }

    pub async fn auth_cleartext(&mut self) {
        self.send(b'R', &3i32.to_be_bytes()).await;
    }

    pub async fn auth_md5(&mut self, salt: [u8; 4]) {
        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(&salt);
        self.send(b'R', &body).await;
    }

    pub async fn auth_sasl(&mut self, mechanisms: &[&str]) {
        let mut body = 10i32.to_be_bytes().to_vec();
        for mechanism in mechanisms {
            body.extend_from_slice(mechanism.as_bytes());
            body.push(0);
        }
        body.push(0);
        self.send(b'R', &body).await;
    }

    pub async fn ready(&mut self) {
        self.send(b'Z', b"I").await;
    }

    pub async fn error(&mut self, code: &str, message: &str) {
        let mut body = Vec::new();
        for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
            body.push(field);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        self.send(b'E', &body).await;
    }

    pub async fn row_description(&mut self, columns: &[&str]) {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for name in columns {
            body.put_slice(name.as_bytes());
            body.put_u8(0);
            body.put_i32(0);
            body.put_i16(0);
            body.put_i32(25);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_i16(0);
        }
        self.send(b'T', &body).await;
    }

    pub async fn data_row(&mut self, values: &[Option<&str>]) {
        let mut body = BytesMut::new();
        body.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(v) => {
                    body.put_i32(v.len() as i32);
                    body.put_slice(v.as_bytes());
                }
                None => body.put_i32(-1),
            }
        }
        self.send(b'D', &body).await;
    }

    pub async fn command_complete(&mut self, tag: &str) {
        let mut body = tag.as_bytes().to_vec();
        body.push(0);
        self.send(b'C', &body).await;
    }

    /// The `IDENTIFY_SYSTEM` result set followed by ReadyForQuery.
    pub async fn identify_system(&mut self, xlogpos: &str) {
        self.row_description(&["systemid", "timeline", "xlogpos", "dbname"])
            .await;
        self.data_row(&[Some("7290218539434170145"), Some("1"), Some(xlogpos), Some("app")])
            .await;
        self.command_complete("IDENTIFY_SYSTEM").await;
        self.ready().await;
    }

    /// CopyBothResponse: text format, no columns.
    pub async fn copy_both(&mut self) {
        self.send(b'W', &[0, 0, 0]).await;
    }

    pub async fn copy_data(&mut self, data: &[u8]) {
        self.send(b'd', data).await;
    }
}

/// Bytes of an XLogData CopyData payload.
pub fn xlog_data(wal_start: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'w');
    buf.put_u64(wal_start);
    buf.put_u64(wal_start + payload.len() as u64);
    buf.put_i64(0);
    buf.put_slice(payload);
    buf.to_vec()
}
