// ABOUTME: Wire codec for the streaming replication sub-protocol
// ABOUTME: Decodes XLogData/keepalive frames and encodes standby status updates

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::lsn::Lsn;

/// Microseconds between the Unix epoch and the Postgres epoch (2000-01-01).
const POSTGRES_EPOCH_OFFSET_US: i64 = 946_684_800_000_000;

/// One frame received over the COPY BOTH stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    /// 'w': a chunk of logical decoding output.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        send_time_us: i64,
        payload: Bytes,
    },
    /// 'k': sender keepalive, optionally demanding an immediate reply.
    Keepalive {
        wal_end: Lsn,
        send_time_us: i64,
        reply_requested: bool,
    },
}

/// Decode one frame of the replication stream.
pub fn parse_frame(mut data: Bytes) -> Result<ReplicationFrame> {
    if data.is_empty() {
        bail!("Empty replication frame");
    }

    let tag = data.get_u8();
    match tag {
        b'w' => {
            if data.remaining() < 24 {
                bail!("Truncated XLogData frame: {} bytes", data.remaining());
            }
            let wal_start = Lsn(data.get_u64());
            let wal_end = Lsn(data.get_u64());
            let send_time_us = data.get_i64();
            Ok(ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                send_time_us,
                payload: data,
            })
        }
        b'k' => {
            if data.remaining() < 17 {
                bail!("Truncated keepalive frame: {} bytes", data.remaining());
            }
            let wal_end = Lsn(data.get_u64());
            let send_time_us = data.get_i64();
            let reply_requested = data.get_u8() != 0;
            Ok(ReplicationFrame::Keepalive {
                wal_end,
                send_time_us,
                reply_requested,
            })
        }
        other => bail!("Unexpected replication frame tag 0x{:02x}", other),
    }
}

/// Encode a standby status update ('r') reporting write/flush/apply
/// positions back to the sender.
pub fn standby_status_update(write: Lsn, flush: Lsn, apply: Lsn, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(write.0);
    buf.put_u64(flush.0);
    buf.put_u64(apply.0);
    buf.put_i64(now_postgres_us());
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

/// Current time in microseconds since the Postgres epoch.
fn now_postgres_us() -> i64 {
    let unix_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    unix_us - POSTGRES_EPOCH_OFFSET_US
}
