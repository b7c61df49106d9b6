use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::lsn::Lsn;
use crate::{Error, Result};

pub const XLOG_DATA_TAG: u8 = b'w';
pub const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

/// Payload of a CopyData message received while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    /// Server heartbeat.
    Keepalive {
        wal_end: Lsn,
        server_time: i64,
        reply_requested: bool,
    },
    /// One WAL record as produced by the output plugin.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time: i64,
        data: Bytes,
    },
}

impl ReplicationMessage {
    pub fn parse(payload: Bytes) -> Result<Self> {
        let mut cursor = payload;
        if !cursor.has_remaining() {
            return Err(Error::Protocol("empty CopyData payload".to_string()));
        }

        match cursor.get_u8() {
            XLOG_DATA_TAG => {
                if cursor.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: format!(
                            "XLogData header too short: {} bytes",
                            cursor.remaining()
                        ),
                    });
                }
                let wal_start = Lsn(cursor.get_u64());
                let wal_end = Lsn(cursor.get_u64());
                let server_time = cursor.get_i64();
                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    server_time,
                    data: cursor,
                })
            }
            PRIMARY_KEEPALIVE_TAG => {
                if cursor.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: format!(
                            "Primary keepalive too short: {} bytes",
                            cursor.remaining()
                        ),
                    });
                }
                Ok(ReplicationMessage::Keepalive {
                    wal_end: Lsn(cursor.get_u64()),
                    server_time: cursor.get_i64(),
                    reply_requested: cursor.get_u8() != 0,
                })
            }
            tag => Err(Error::Protocol(format!(
                "unexpected CopyData message: 0x{:02x}",
                tag
            ))),
        }
    }
}

/// Standby status update sent to acknowledge processed WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub write: Lsn,
    pub flush: Lsn,
    pub apply: Lsn,
    /// Client clock, microseconds since 2000-01-01
    pub client_time: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// An update acknowledging `lsn` as written, flushed and applied.
    pub fn acknowledge(lsn: Lsn, client_time: i64) -> Self {
        Self {
            write: lsn,
            flush: lsn,
            apply: lsn,
            client_time,
            reply_requested: false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
        buf.put_u64(self.write.0);
        buf.put_u64(self.flush.0);
        buf.put_u64(self.apply.0);
        buf.put_i64(self.client_time);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }
}
