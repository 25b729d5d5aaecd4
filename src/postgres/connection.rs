use bytes::{Buf, BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::{backend, frontend};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::types::{quote_ident, Lsn, TableName};
use crate::{Error, Result};

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

const APPLICATION_NAME: &str = "pg-truck";

/// One backend frame: tag byte plus body, length prefix stripped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

impl Frame {
    /// Re-encodes the frame so `postgres_protocol` can parse it.
    fn parse(self) -> Result<backend::Message> {
        let mut raw = BytesMut::with_capacity(self.body.len() + 5);
        raw.put_u8(self.tag);
        raw.put_i32(self.body.len() as i32 + 4);
        raw.put_slice(&self.body);
        backend::Message::parse(&mut raw)?.ok_or_else(|| {
            Error::Protocol(format!("incomplete '{}' message", self.tag as char))
        })
    }

    fn error_message(self) -> String {
        match self.parse() {
            Ok(backend::Message::ErrorResponse(body)) => describe_error(&body),
            Ok(_) => "unexpected message".to_string(),
            Err(e) => e.to_string(),
        }
    }
}

fn describe_error(body: &backend::ErrorResponseBody) -> String {
    let mut severity = None;
    let mut code = None;
    let mut message = None;
    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'S' => severity = Some(String::from_utf8_lossy(field.value_bytes()).into_owned()),
            b'C' => code = Some(String::from_utf8_lossy(field.value_bytes()).into_owned()),
            b'M' => message = Some(String::from_utf8_lossy(field.value_bytes()).into_owned()),
            _ => {}
        }
    }
    format!(
        "{} {}: {}",
        severity.unwrap_or_else(|| "ERROR".to_string()),
        code.unwrap_or_default(),
        message.unwrap_or_else(|| "unknown error".to_string())
    )
}

/// Reads length-prefixed backend frames from a byte stream.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(8192),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if self.buf.len() >= 5 {
                let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
                if len < 4 {
                    return Err(Error::Protocol(format!("invalid frame length {}", len)));
                }
                let total = len as usize + 1;
                if self.buf.len() >= total {
                    let mut frame = self.buf.split_to(total);
                    let tag = frame.get_u8();
                    frame.advance(4);
                    return Ok(Frame {
                        tag,
                        body: frame.freeze(),
                    });
                }
                self.buf.reserve(total - self.buf.len());
            }

            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::Connection("server closed the connection".to_string()));
            }
        }
    }
}

/// Row returned by a simple query on a replication connection.
#[derive(Debug, Clone)]
pub struct SimpleRow {
    columns: Arc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, name: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.values.get(index)?.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// Result of `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub slot_name: String,
    pub consistent_point: Lsn,
    /// Exported snapshot, valid while the creating connection stays open
    /// and idle.
    pub snapshot_name: Option<String>,
}

/// Connection parameters extracted from a libpq-style URL.
#[derive(Debug, Clone)]
struct ConnectParams {
    host: String,
    port: u16,
    user: String,
    password: Option<Vec<u8>>,
    database: String,
}

impl ConnectParams {
    fn from_url(url: &str) -> Result<Self> {
        let config: tokio_postgres::Config = url.parse()?;
        let host = match config.get_hosts().first() {
            Some(tokio_postgres::config::Host::Tcp(host)) => host.clone(),
            Some(_) => {
                return Err(Error::Connection(
                    "replication connections require a TCP host".to_string(),
                ))
            }
            None => "localhost".to_string(),
        };
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config
            .get_user()
            .map(str::to_string)
            .ok_or_else(|| Error::Connection("connection URL has no user".to_string()))?;
        let database = config
            .get_dbname()
            .map(str::to_string)
            .unwrap_or_else(|| user.clone());
        Ok(Self {
            host,
            port,
            user,
            password: config.get_password().map(<[u8]>::to_vec),
            database,
        })
    }
}

/// A connection opened with `replication=database`, able to run walsender
/// commands and to enter streaming mode.
pub struct ReplicationConnection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    user: String,
    database: String,
}

impl ReplicationConnection {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let params = ConnectParams::from_url(url)?;
        info!(
            "Opening replication connection to {}:{} as {}",
            params.host, params.port, params.user
        );

        timeout(connect_timeout, Self::establish(params))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("replication connection not ready after {:?}", connect_timeout),
            })?
    }

    async fn establish(params: ConnectParams) -> Result<Self> {
        let stream = TcpStream::connect((params.host.as_str(), params.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        let mut conn = Self {
            reader: FrameReader::new(read_half),
            writer,
            user: params.user.clone(),
            database: params.database.clone(),
        };

        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", params.user.as_str()),
                ("database", params.database.as_str()),
                ("replication", "database"),
                ("application_name", APPLICATION_NAME),
            ],
            &mut buf,
        )?;
        conn.send(&buf).await?;

        conn.authenticate(params.password.as_deref()).await?;
        conn.wait_ready().await?;
        debug!("Replication connection ready");
        Ok(conn)
    }

    async fn authenticate(&mut self, password: Option<&[u8]>) -> Result<()> {
        let require_password = || {
            password.ok_or_else(|| {
                Error::Authentication("server requested a password but none was given".to_string())
            })
        };
        let mut scram: Option<ScramSha256> = None;

        loop {
            let frame = self.reader.read_frame().await?;
            let tag = frame.tag;
            let mut buf = BytesMut::new();
            match frame.parse()? {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    frontend::password_message(require_password()?, &mut buf)?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash = md5_hash(self.user.as_bytes(), require_password()?, body.salt());
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        supported |= mechanism == SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "server offers no supported SASL mechanism".to_string(),
                        ));
                    }
                    let state = ScramSha256::new(require_password()?, ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, state.message(), &mut buf)?;
                    scram = Some(state);
                }
                backend::Message::AuthenticationSaslContinue(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        Error::Authentication("unexpected SASL continuation".to_string())
                    })?;
                    state
                        .update(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(state.message(), &mut buf)?;
                }
                backend::Message::AuthenticationSaslFinal(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        Error::Authentication("unexpected SASL final message".to_string())
                    })?;
                    state
                        .finish(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    continue;
                }
                backend::Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(describe_error(&body)));
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during authentication: '{}'",
                        tag as char
                    )))
                }
            }
            self.send(&buf).await?;
        }
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            let frame = self.reader.read_frame().await?;
            match frame.tag {
                b'Z' => return Ok(()),
                b'E' => return Err(Error::Connection(frame.error_message())),
                // ParameterStatus, BackendKeyData, NoticeResponse
                _ => trace!("Skipping startup message '{}'", frame.tag as char),
            }
        }
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Runs a replication command and collects its text rows.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        debug!("Replication command: {}", query);
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.send(&buf).await?;

        let mut columns = Arc::new(Vec::new());
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            let frame = self.reader.read_frame().await?;
            match frame.tag {
                b'T' => {
                    if let backend::Message::RowDescription(body) = frame.parse()? {
                        let names = body
                            .fields()
                            .map(|field| Ok(field.name().to_string()))
                            .collect::<Vec<_>>()?;
                        columns = Arc::new(names);
                    }
                }
                b'D' => {
                    if let backend::Message::DataRow(body) = frame.parse()? {
                        let buffer = body.buffer();
                        let values = body
                            .ranges()
                            .map(|range| {
                                Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                            })
                            .collect::<Vec<_>>()?;
                        rows.push(SimpleRow {
                            columns: columns.clone(),
                            values,
                        });
                    }
                }
                b'E' => failure = Some(frame.error_message()),
                b'Z' => break,
                // CommandComplete, EmptyQueryResponse, NoticeResponse
                _ => {}
            }
        }

        match failure {
            Some(message) => Err(Error::Replication { message }),
            None => Ok(rows),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| Error::Replication {
            message: "IDENTIFY_SYSTEM returned no rows".to_string(),
        })?;

        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or_default().to_string(),
            timeline: row
                .get("timeline")
                .and_then(|t| t.parse().ok())
                .unwrap_or(1),
            xlogpos: row.get("xlogpos").unwrap_or("0/0").parse()?,
            dbname: row.get("dbname").map(str::to_string),
        };
        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Creates a wal2json slot and exports its snapshot. The snapshot stays
    /// importable until this connection runs another command or closes.
    pub async fn create_replication_slot(
        &mut self,
        slot_name: &str,
        temporary: bool,
    ) -> Result<SlotInfo> {
        let query = format!(
            "CREATE_REPLICATION_SLOT {}{} LOGICAL wal2json EXPORT_SNAPSHOT",
            quote_ident(slot_name),
            if temporary { " TEMPORARY" } else { "" }
        );
        let rows = self.simple_query(&query).await?;
        let row = rows.first().ok_or_else(|| Error::Replication {
            message: format!("CREATE_REPLICATION_SLOT {} returned no rows", slot_name),
        })?;

        let info = SlotInfo {
            slot_name: row.get("slot_name").unwrap_or(slot_name).to_string(),
            consistent_point: row
                .get("consistent_point")
                .ok_or_else(|| Error::Replication {
                    message: "slot creation did not report a consistent point".to_string(),
                })?
                .parse()?,
            snapshot_name: row.get("snapshot_name").map(str::to_string),
        };
        info!(
            "Created {}replication slot '{}' consistent at {}",
            if temporary { "temporary " } else { "" },
            info.slot_name,
            info.consistent_point
        );
        Ok(info)
    }

    /// Enters CopyBoth mode. `options` are passed to the output plugin.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        start: Lsn,
        options: &[(&str, String)],
    ) -> Result<ReplicationStream> {
        let query = start_replication_command(slot_name, start, options);
        info!("Starting replication on '{}' from {}", slot_name, start);

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.send(&buf).await?;

        loop {
            let frame = self.reader.read_frame().await?;
            match frame.tag {
                b'W' => {
                    debug!("Entered CopyBoth mode");
                    return Ok(ReplicationStream {
                        reader: WalReader {
                            frames: self.reader,
                        },
                        sender: StatusSender {
                            writer: self.writer,
                        },
                    });
                }
                b'E' => {
                    return Err(Error::Replication {
                        message: frame.error_message(),
                    })
                }
                b'N' => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected response to START_REPLICATION: '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::terminate(&mut buf);
        self.send(&buf).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn start_replication_command(slot_name: &str, start: Lsn, options: &[(&str, String)]) -> String {
    let mut query = format!(
        "START_REPLICATION SLOT {} LOGICAL {}",
        quote_ident(slot_name),
        start
    );
    if !options.is_empty() {
        let rendered: Vec<_> = options
            .iter()
            .map(|(name, value)| format!("{} '{}'", quote_ident(name), value.replace('\'', "''")))
            .collect();
        query.push_str(&format!(" ({})", rendered.join(", ")));
    }
    query
}

/// A connection in CopyBoth mode.
pub struct ReplicationStream {
    reader: WalReader,
    sender: StatusSender,
}

impl ReplicationStream {
    pub fn into_split(self) -> (WalReader, StatusSender) {
        (self.reader, self.sender)
    }
}

pub struct WalReader {
    frames: FrameReader<OwnedReadHalf>,
}

impl WalReader {
    /// Next streaming message; `None` once the server ends the copy.
    pub async fn next_message(&mut self) -> Result<Option<CopyBothMessage>> {
        read_copy_message(&mut self.frames).await
    }
}

async fn read_copy_message<R: AsyncRead + Unpin>(
    frames: &mut FrameReader<R>,
) -> Result<Option<CopyBothMessage>> {
    loop {
        let frame = frames.read_frame().await?;
        match frame.tag {
            b'd' => return CopyBothMessage::parse(frame.body).map(Some),
            b'c' => return Ok(None),
            b'E' => {
                return Err(Error::Replication {
                    message: frame.error_message(),
                })
            }
            b'N' => trace!("Skipping notice during replication"),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message type during replication: '{}'",
                    other as char
                )))
            }
        }
    }
}

pub struct StatusSender {
    writer: OwnedWriteHalf,
}

impl StatusSender {
    /// Reports `lsn` as written, flushed and applied.
    pub async fn send_status(&mut self, lsn: Lsn, reply_requested: bool) -> Result<()> {
        trace!("Standby status update at {}", lsn);
        let frame = encode_status_update(lsn, SystemTime::now(), reply_requested);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Ends the copy and closes the connection.
    pub async fn finish(&mut self) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::copy_done(&mut buf);
        frontend::terminate(&mut buf);
        self.writer.write_all(&buf).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Messages the server sends inside CopyData while streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyBothMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        timestamp: i64,
        data: Bytes,
    },
    Keepalive {
        wal_end: Lsn,
        timestamp: i64,
        reply: bool,
    },
}

impl CopyBothMessage {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid_message("Empty message"));
        }

        let tag = data.get_u8();
        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::invalid_message("Invalid XLogData message size"));
                }
                let wal_start = Lsn(data.get_u64());
                let wal_end = Lsn(data.get_u64());
                let timestamp = data.get_i64();
                Ok(CopyBothMessage::XLogData {
                    wal_start,
                    wal_end,
                    timestamp,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::invalid_message("Invalid keepalive message size"));
                }
                let wal_end = Lsn(data.get_u64());
                let timestamp = data.get_i64();
                let reply = data.get_u8() != 0;
                Ok(CopyBothMessage::Keepalive {
                    wal_end,
                    timestamp,
                    reply,
                })
            }
            _ => Err(Error::invalid_message(format!("Unknown message tag: {}", tag))),
        }
    }
}

/// Microseconds since the PostgreSQL epoch.
fn pg_timestamp(now: SystemTime) -> i64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64 - (PG_EPOCH_OFFSET_SECS as i64) * 1_000_000)
        .unwrap_or(0)
}

/// Builds a CopyData frame holding a standby status update.
pub fn encode_status_update(lsn: Lsn, now: SystemTime, reply_requested: bool) -> Bytes {
    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(b'r');
    payload.put_u64(lsn.0);
    payload.put_u64(lsn.0);
    payload.put_u64(lsn.0);
    payload.put_i64(pg_timestamp(now));
    payload.put_u8(reply_requested as u8);

    let mut frame = BytesMut::with_capacity(payload.len() + 5);
    frame.put_u8(b'd');
    frame.put_i32(payload.len() as i32 + 4);
    frame.put_slice(&payload);
    frame.freeze()
}

/// Plugin options for wal2json format 1 restricted to `tables`.
pub fn wal2json_options<'a>(
    tables: impl IntoIterator<Item = &'a TableName>,
) -> Vec<(&'static str, String)> {
    let filter: Vec<_> = tables
        .into_iter()
        .map(|table| format!("{}.{}", escape_filter(&table.schema), escape_filter(&table.name)))
        .collect();
    vec![
        ("include-xids", "0".to_string()),
        ("include-timestamp", "0".to_string()),
        ("include-type-oids", "0".to_string()),
        ("include-lsn", "1".to_string()),
        ("add-tables", filter.join(",")),
    ]
}

/// wal2json table filters treat these characters specially unless escaped.
fn escape_filter(ident: &str) -> String {
    let mut escaped = String::with_capacity(ident.len());
    for c in ident.chars() {
        if matches!(c, ',' | '.' | '\\' | ' ' | '*' | '\'') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
