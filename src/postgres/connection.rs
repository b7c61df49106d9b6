use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{md5_hash, sasl};
use postgres_protocol::message::backend::{self, ErrorResponseBody};
use postgres_protocol::message::frontend;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::config::Host;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, trace, warn};

use super::protocol::StandbyStatusUpdate;
use crate::{Error, Result};

/// Shared handle to the control connection's client.
///
/// Collaborators such as the schema loader query through it. Only
/// [`ConnectionManager`] can close the underlying connection.
pub type ControlClient = Arc<Client>;

/// A frame received on the replication connection while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// A CopyData payload: keepalive or WAL data.
    CopyData(Bytes),
    /// Anything else the server sent; fatal for the fetch loop.
    Unexpected(String),
}

/// The streaming half of a replication session, as seen by the fetch loop.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// Receives the next frame. Must be cancel safe: the fetch loop wraps
    /// every call in a deadline and drops it when the deadline passes.
    async fn recv(&mut self) -> Result<StreamFrame>;

    async fn send_status(&mut self, update: &StandbyStatusUpdate) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

pub struct ControlConnection {
    client: ControlClient,
    connection_task: tokio::task::JoinHandle<()>,
}

impl ControlConnection {
    pub async fn connect(connection_string: &str, connect_timeout: Duration) -> Result<Self> {
        info!("Opening control connection to PostgreSQL");

        let connect = tokio_postgres::connect(connection_string, NoTls);
        let (client, connection) = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "control connection timed out after {:?}",
                    connect_timeout
                ))
            })?
            .map_err(|e| Error::Connection(format!("control connection failed: {}", e)))?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Control connection error: {}", e);
            }
        });

        info!("Control connection established");
        Ok(Self {
            client: Arc::new(client),
            connection_task,
        })
    }

    pub fn client(&self) -> ControlClient {
        self.client.clone()
    }

    fn close(self) {
        self.connection_task.abort();
    }
}

/// A single text row returned by a simple query on the replication connection.
#[derive(Debug, Clone)]
pub struct SimpleRow {
    columns: Arc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)?.as_deref()
    }
}

const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

enum Frame {
    CopyBothResponse,
    Message(backend::Message),
}

/// A wire-level connection in `replication=database` mode.
///
/// tokio-postgres cannot enter CopyBoth mode, so the replication session
/// speaks the protocol directly using `postgres-protocol` for the message
/// codec.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    streaming: bool,
    closed: bool,
}

impl ReplicationConnection {
    pub async fn connect(connection_string: &str, connect_timeout: Duration) -> Result<Self> {
        info!("Opening replication connection to PostgreSQL");

        let config = strip_replication_param(connection_string)
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Connection(format!("invalid replication connection string: {}", e)))?;

        let user = config
            .get_user()
            .ok_or_else(|| Error::Connection("replication connection string has no user".to_string()))?
            .to_string();
        let database = config.get_dbname().unwrap_or(&user).to_string();
        let password = config.get_password().map(|p| p.to_vec());
        let timeout = config.get_connect_timeout().copied().unwrap_or(connect_timeout);

        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            Some(_) => {
                return Err(Error::Connection(
                    "unix socket hosts are not supported for replication".to_string(),
                ))
            }
            None => "localhost".to_string(),
        };
        let port = config.get_ports().first().copied().unwrap_or(5432);

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "replication connection to {}:{} timed out after {:?}",
                    host, port, timeout
                ))
            })?
            .map_err(|e| {
                Error::Connection(format!(
                    "replication connection to {}:{} failed: {}",
                    host, port, e
                ))
            })?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(1024),
            streaming: false,
            closed: false,
        };

        let mut params = vec![
            ("user", user.as_str()),
            ("database", database.as_str()),
            ("replication", "database"),
            ("client_encoding", "UTF8"),
        ];
        if let Some(app) = config.get_application_name() {
            params.push(("application_name", app));
        }

        conn.establish(params, &user, password.as_deref())
            .await
            .map_err(|e| match e {
                Error::Connection(_) => e,
                other => Error::Connection(format!(
                    "replication connection to {}:{} failed: {}",
                    host, port, other
                )),
            })?;

        info!(
            "Replication connection established to {}:{} as {}",
            host, port, user
        );
        Ok(conn)
    }

    /// Startup, authentication and the wait for the first ReadyForQuery.
    async fn establish(
        &mut self,
        params: Vec<(&str, &str)>,
        user: &str,
        password: Option<&[u8]>,
    ) -> Result<()> {
        self.stream.set_nodelay(true)?;
        frontend::startup_message(params, &mut self.write_buf)?;
        self.flush().await?;

        self.authenticate(user, password).await?;
        self.wait_ready().await
    }

    async fn authenticate(&mut self, user: &str, password: Option<&[u8]>) -> Result<()> {
        let require_password = || {
            password.ok_or_else(|| {
                Error::Authentication("server requested a password but none was given".to_string())
            })
        };

        loop {
            match self.read_message().await? {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    frontend::password_message(require_password()?, &mut self.write_buf)?;
                    self.flush().await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash = md5_hash(user.as_bytes(), require_password()?, body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut offered = false;
                    while let Some(mechanism) = mechanisms.next().map_err(protocol_error)? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            offered = true;
                        }
                    }
                    if !offered {
                        return Err(Error::Authentication(
                            "server does not offer SCRAM-SHA-256".to_string(),
                        ));
                    }
                    self.authenticate_scram(require_password()?).await?;
                }
                backend::Message::ErrorResponse(body) => {
                    return Err(Error::Server {
                        message: server_error_message(&body),
                    });
                }
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message during authentication".to_string(),
                    ))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, password: &[u8]) -> Result<()> {
        let mut scram = sasl::ScramSha256::new(password, sasl::ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_message().await? {
            backend::Message::AuthenticationSaslContinue(body) => {
                scram
                    .update(body.data())
                    .map_err(|e| Error::Authentication(e.to_string()))?;
            }
            backend::Message::ErrorResponse(body) => {
                return Err(Error::Authentication(server_error_message(&body)))
            }
            _ => {
                return Err(Error::Protocol(
                    "expected AuthenticationSASLContinue".to_string(),
                ))
            }
        }

        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_message().await? {
            backend::Message::AuthenticationSaslFinal(body) => scram
                .finish(body.data())
                .map_err(|e| Error::Authentication(e.to_string())),
            backend::Message::ErrorResponse(body) => {
                Err(Error::Authentication(server_error_message(&body)))
            }
            _ => Err(Error::Protocol(
                "expected AuthenticationSASLFinal".to_string(),
            )),
        }
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                backend::Message::ReadyForQuery(_) => return Ok(()),
                backend::Message::ErrorResponse(body) => {
                    return Err(Error::Server {
                        message: server_error_message(&body),
                    })
                }
                _ => {}
            }
        }
    }

    /// Runs a replication command through the simple query protocol and
    /// collects its text rows.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<SimpleRow>> {
        if self.streaming {
            return Err(Error::Replication {
                message: "cannot run queries while streaming".to_string(),
            });
        }
        debug!("Sending replication command: {}", sql);
        frontend::query(sql, &mut self.write_buf)?;
        self.flush().await?;

        let mut columns = Arc::new(Vec::new());
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            match self.read_message().await? {
                backend::Message::RowDescription(body) => {
                    let names = body
                        .fields()
                        .map(|f| Ok(f.name().to_string()))
                        .collect::<Vec<_>>()
                        .map_err(protocol_error)?;
                    columns = Arc::new(names);
                }
                backend::Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let values = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                        })
                        .collect::<Vec<_>>()
                        .map_err(protocol_error)?;
                    rows.push(SimpleRow::new(columns.clone(), values));
                }
                backend::Message::ErrorResponse(body) => {
                    failure = Some(Error::Server {
                        message: server_error_message(&body),
                    });
                }
                backend::Message::ReadyForQuery(_) => break,
                _ => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Sends a `START_REPLICATION` command and waits for the server to enter
    /// CopyBoth mode.
    pub async fn start_copy_both(&mut self, command: &str) -> Result<()> {
        debug!("Sending replication command: {}", command);
        frontend::query(command, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            match self.read_frame().await? {
                Frame::CopyBothResponse => {
                    self.streaming = true;
                    return Ok(());
                }
                Frame::Message(backend::Message::ErrorResponse(body)) => {
                    // The server follows the error with ReadyForQuery.
                    let message = server_error_message(&body);
                    let _ = self.wait_ready().await;
                    return Err(Error::Server { message });
                }
                Frame::Message(backend::Message::NoticeResponse(body)) => {
                    warn!("Server notice: {}", notice_message(&body));
                }
                Frame::Message(_) => {}
            }
        }
    }

    /// Reads one complete backend message. Cancel safe: partially received
    /// bytes stay in the read buffer.
    async fn read_message(&mut self) -> Result<backend::Message> {
        match self.read_frame().await? {
            Frame::Message(message) => Ok(message),
            Frame::CopyBothResponse => Err(Error::Protocol(
                "unexpected CopyBothResponse".to_string(),
            )),
        }
    }

    /// Like [`read_message`](Self::read_message), but also recognises
    /// CopyBothResponse, which `postgres-protocol` does not decode.
    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.take_copy_both_response()? {
                return Ok(frame);
            }
            if let Some(message) = backend::Message::parse(&mut self.read_buf).map_err(protocol_error)? {
                return Ok(Frame::Message(message));
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::Connection(
                    "replication connection closed by server".to_string(),
                ));
            }
        }
    }

    /// Consumes a buffered CopyBothResponse. Its body (copy format and
    /// column formats) carries nothing the stream needs.
    fn take_copy_both_response(&mut self) -> Result<Option<Frame>> {
        if self.read_buf.len() < 5 || self.read_buf[0] != COPY_BOTH_RESPONSE_TAG {
            return Ok(None);
        }
        let len = (&self.read_buf[1..5]).get_i32();
        if len < 4 {
            return Err(Error::Protocol(format!(
                "invalid CopyBothResponse length: {}",
                len
            )));
        }
        let total = 1 + len as usize;
        if self.read_buf.len() < total {
            return Ok(None);
        }
        self.read_buf.advance(total);
        Ok(Some(Frame::CopyBothResponse))
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}

#[async_trait]
impl ReplicationTransport for ReplicationConnection {
    async fn recv(&mut self) -> Result<StreamFrame> {
        loop {
            match self.read_message().await? {
                backend::Message::CopyData(body) => return Ok(StreamFrame::CopyData(body.into_bytes())),
                backend::Message::NoticeResponse(body) => {
                    warn!("Server notice: {}", notice_message(&body));
                }
                backend::Message::ParameterStatus(_) => {
                    trace!("Ignoring parameter status while streaming");
                }
                backend::Message::ErrorResponse(body) => {
                    return Err(Error::Server {
                        message: server_error_message(&body),
                    })
                }
                backend::Message::CopyDone => {
                    return Ok(StreamFrame::Unexpected("CopyDone".to_string()))
                }
                _ => return Ok(StreamFrame::Unexpected("non-CopyData message".to_string())),
            }
        }
    }

    async fn send_status(&mut self, update: &StandbyStatusUpdate) -> Result<()> {
        frontend::CopyData::new(update.encode())?.write(&mut self.write_buf);
        self.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
            self.streaming = false;
        }
        frontend::terminate(&mut self.write_buf);
        let flushed = self.flush().await;
        let shutdown = self.stream.shutdown().await;
        flushed?;
        shutdown?;
        Ok(())
    }
}

/// Owns the control and replication connections and closes each at most once.
pub struct ConnectionManager<T = ReplicationConnection> {
    control: Option<ControlConnection>,
    replication: Option<T>,
}

impl<T> Default for ConnectionManager<T> {
    fn default() -> Self {
        Self {
            control: None,
            replication: None,
        }
    }
}

impl ConnectionManager<ReplicationConnection> {
    pub async fn open_control(
        &mut self,
        connection_string: &str,
        connect_timeout: Duration,
    ) -> Result<ControlClient> {
        let control = ControlConnection::connect(connection_string, connect_timeout).await?;
        let client = control.client();
        if let Some(previous) = self.control.replace(control) {
            previous.close();
        }
        Ok(client)
    }

    pub async fn open_replication(
        &mut self,
        connection_string: &str,
        connect_timeout: Duration,
    ) -> Result<&mut ReplicationConnection> {
        let conn = ReplicationConnection::connect(connection_string, connect_timeout).await?;
        Ok(self.replication.insert(conn))
    }
}

impl<T: ReplicationTransport> ConnectionManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replication(replication: T) -> Self {
        Self {
            control: None,
            replication: Some(replication),
        }
    }

    pub fn control_client(&self) -> Option<ControlClient> {
        self.control.as_ref().map(ControlConnection::client)
    }

    pub fn replication_mut(&mut self) -> Option<&mut T> {
        self.replication.as_mut()
    }

    pub fn is_open(&self) -> bool {
        self.control.is_some() || self.replication.is_some()
    }

    /// Closes both connections. Calls after the first are no-ops.
    pub async fn close(&mut self) {
        if let Some(mut replication) = self.replication.take() {
            info!("Closing replication connection");
            if let Err(e) = replication.close().await {
                warn!("Error while closing replication connection: {}", e);
            }
        }
        if let Some(control) = self.control.take() {
            info!("Closing control connection");
            control.close();
        }
    }
}

fn protocol_error(e: std::io::Error) -> Error {
    Error::Protocol(e.to_string())
}

fn server_error_message(body: &ErrorResponseBody) -> String {
    format_error_fields(body.fields())
}

fn notice_message(body: &backend::NoticeResponseBody) -> String {
    format_error_fields(body.fields())
}

fn format_error_fields(mut fields: backend::ErrorFields<'_>) -> String {
    let mut message = None;
    let mut code = None;
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'M' => message = Some(String::from_utf8_lossy(field.value_bytes()).into_owned()),
            b'C' => code = Some(String::from_utf8_lossy(field.value_bytes()).into_owned()),
            _ => {}
        }
    }
    match (message, code) {
        (Some(m), Some(c)) => format!("{} (SQLSTATE {})", m, c),
        (Some(m), None) => m,
        _ => "unknown server error".to_string(),
    }
}

/// Removes a `replication` option from a connection string. The replication
/// connection always starts in `replication=database` mode itself, and
/// tokio-postgres rejects the option when parsing.
pub fn strip_replication_param(connection_string: &str) -> String {
    let trimmed = connection_string.trim();
    if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
        let Some((base, query)) = trimmed.split_once('?') else {
            return trimmed.to_string();
        };
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !pair.starts_with("replication="))
            .collect();
        if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        }
    } else {
        match key_value_pairs(trimmed) {
            Some(pairs) => pairs
                .into_iter()
                .filter(|(key, _)| *key != "replication")
                .map(|(_, pair)| pair)
                .collect::<Vec<_>>()
                .join(" "),
            // Leave malformed strings for the parser to report.
            None => trimmed.to_string(),
        }
    }
}

/// Splits `key = value` settings, returning each key with the pair's
/// original text. Quoted values keep their inner whitespace and escapes.
fn key_value_pairs(s: &str) -> Option<Vec<(&str, &str)>> {
    let bytes = s.as_bytes();
    let skip_ws = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };

    let mut pairs = Vec::new();
    let mut i = skip_ws(0);
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let key = &s[start..i];

        i = skip_ws(i);
        if bytes.get(i) != Some(&b'=') {
            return None;
        }
        i = skip_ws(i + 1);

        if bytes.get(i) == Some(&b'\'') {
            i += 1;
            loop {
                match bytes.get(i)? {
                    b'\'' => break,
                    b'\\' => i += 2,
                    _ => i += 1,
                }
            }
            i += 1;
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
        }

        pairs.push((key, &s[start..i]));
        i = skip_ws(i);
    }
    Some(pairs)
}
