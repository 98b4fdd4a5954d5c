//! Wire framing for tablet-manager RPCs.
//!
//! Requests and responses are typed Rust enums serialized as JSON inside
//! length-prefixed frames (u32 big-endian length, then payload). The Rust
//! types are the source of truth; the frame is only an envelope, so there is
//! no schema to drift from.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use kestrel_common::error::TmcError;
use kestrel_common::types::{Tablet, TabletAlias};
use kestrel_mysql::Position;

use crate::client::TabletManagerClient;
use crate::replication::{PrimaryStatus, StopReplicationMode, StopReplicationStatus};

/// Upper bound on a single frame. A GTID set with thousands of source UUIDs
/// stays well under this; anything bigger is a corrupt length prefix.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Request payloads, one per RPC on the tablet-manager surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum TmRequest {
    StopReplicationAndGetStatus {
        mode: StopReplicationMode,
    },
    SetSource {
        host: String,
        port: u16,
        start_replication: bool,
        force_start: bool,
    },
    PromoteReplica,
    DemotePrimary,
    UndoDemotePrimary,
    WaitForPosition {
        position: Position,
    },
    PopulateReparentJournal {
        term_counter: i64,
        action_name: String,
        primary_alias: TabletAlias,
        position: Position,
        time_created_ns: u64,
    },
    ReadReparentJournalInfo,
    PrimaryStatus,
    PrimaryPosition,
}

/// Response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TmResponse {
    Ok,
    StopStatus(StopReplicationStatus),
    Position(Position),
    PrimaryStatus(PrimaryStatus),
    JournalInfo { term_counter: i64 },
    Error { not_replica: bool, message: String },
}

/// Serialize a message into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Bytes, TmcError> {
    let payload = serde_json::to_vec(msg).map_err(|e| TmcError::Wire(e.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TmcError::Wire(format!(
            "frame of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Write one frame to the stream.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), TmcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| TmcError::Wire(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TmcError::Wire(e.to_string()))
}

/// Read one frame from the stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TmcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader
        .read_u32()
        .await
        .map_err(|e| TmcError::Wire(e.to_string()))? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TmcError::Wire(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_BYTES}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| TmcError::Wire(e.to_string()))?;
    serde_json::from_slice(&payload).map_err(|e| TmcError::Wire(e.to_string()))
}

/// Tablet-manager client over plain TCP, one connection per call.
///
/// Reparent RPCs are rare and long-lived (seconds, not microseconds), so a
/// connection pool buys nothing here; a fresh connection per call keeps
/// failure domains per-RPC.
pub struct TcpTabletClient;

impl TcpTabletClient {
    pub fn new() -> Self {
        Self
    }

    async fn call(
        &self,
        tablet: &Tablet,
        rpc: &'static str,
        request: TmRequest,
        deadline: Duration,
    ) -> Result<TmResponse, TmcError> {
        let alias = tablet.alias.clone();
        let addr = (tablet.hostname.clone(), tablet.agent_port);
        let exchange = async {
            let mut stream =
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| TmcError::Connect {
                        tablet: tablet.alias.clone(),
                        reason: e.to_string(),
                    })?;
            write_frame(&mut stream, &request).await?;
            read_frame::<TcpStream, TmResponse>(&mut stream).await
        };
        let response = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| TmcError::Timeout {
                rpc,
                tablet: alias.clone(),
                timeout_ms: deadline.as_millis() as u64,
            })??;
        match response {
            TmResponse::Error {
                not_replica: true, ..
            } => Err(TmcError::NotReplica(alias)),
            TmResponse::Error { message, .. } => Err(TmcError::Remote {
                tablet: alias,
                reason: message,
            }),
            other => Ok(other),
        }
    }

    fn unexpected(tablet: &Tablet, rpc: &'static str, response: &TmResponse) -> TmcError {
        TmcError::Remote {
            tablet: tablet.alias.clone(),
            reason: format!("unexpected response to {rpc}: {response:?}"),
        }
    }
}

impl Default for TcpTabletClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TabletManagerClient for TcpTabletClient {
    async fn stop_replication_and_get_status(
        &self,
        tablet: &Tablet,
        mode: StopReplicationMode,
        deadline: Duration,
    ) -> Result<StopReplicationStatus, TmcError> {
        const RPC: &str = "stop_replication_and_get_status";
        match self
            .call(tablet, RPC, TmRequest::StopReplicationAndGetStatus { mode }, deadline)
            .await?
        {
            TmResponse::StopStatus(status) => Ok(status),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn set_source(
        &self,
        tablet: &Tablet,
        host: &str,
        port: u16,
        start_replication: bool,
        force_start: bool,
        deadline: Duration,
    ) -> Result<(), TmcError> {
        const RPC: &str = "set_source";
        let request = TmRequest::SetSource {
            host: host.to_string(),
            port,
            start_replication,
            force_start,
        };
        match self.call(tablet, RPC, request, deadline).await? {
            TmResponse::Ok => Ok(()),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn promote_replica(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<Position, TmcError> {
        const RPC: &str = "promote_replica";
        match self.call(tablet, RPC, TmRequest::PromoteReplica, deadline).await? {
            TmResponse::Position(position) => Ok(position),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn demote_primary(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<Position, TmcError> {
        const RPC: &str = "demote_primary";
        match self.call(tablet, RPC, TmRequest::DemotePrimary, deadline).await? {
            TmResponse::Position(position) => Ok(position),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn undo_demote_primary(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<(), TmcError> {
        const RPC: &str = "undo_demote_primary";
        match self.call(tablet, RPC, TmRequest::UndoDemotePrimary, deadline).await? {
            TmResponse::Ok => Ok(()),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        position: &Position,
        deadline: Duration,
    ) -> Result<(), TmcError> {
        const RPC: &str = "wait_for_position";
        let request = TmRequest::WaitForPosition {
            position: position.clone(),
        };
        match self.call(tablet, RPC, request, deadline).await? {
            TmResponse::Ok => Ok(()),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn populate_reparent_journal(
        &self,
        tablet: &Tablet,
        term_counter: i64,
        action_name: &str,
        primary_alias: &TabletAlias,
        position: &Position,
        time_created_ns: u64,
        deadline: Duration,
    ) -> Result<(), TmcError> {
        const RPC: &str = "populate_reparent_journal";
        let request = TmRequest::PopulateReparentJournal {
            term_counter,
            action_name: action_name.to_string(),
            primary_alias: primary_alias.clone(),
            position: position.clone(),
            time_created_ns,
        };
        match self.call(tablet, RPC, request, deadline).await? {
            TmResponse::Ok => Ok(()),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn read_reparent_journal_info(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<i64, TmcError> {
        const RPC: &str = "read_reparent_journal_info";
        match self
            .call(tablet, RPC, TmRequest::ReadReparentJournalInfo, deadline)
            .await?
        {
            TmResponse::JournalInfo { term_counter } => Ok(term_counter),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn primary_status(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<PrimaryStatus, TmcError> {
        const RPC: &str = "primary_status";
        match self.call(tablet, RPC, TmRequest::PrimaryStatus, deadline).await? {
            TmResponse::PrimaryStatus(status) => Ok(status),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }

    async fn primary_position(
        &self,
        tablet: &Tablet,
        deadline: Duration,
    ) -> Result<Position, TmcError> {
        const RPC: &str = "primary_position";
        match self.call(tablet, RPC, TmRequest::PrimaryPosition, deadline).await? {
            TmResponse::Position(position) => Ok(position),
            other => Err(Self::unexpected(tablet, RPC, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::TabletRole;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let request = TmRequest::SetSource {
            host: "db1".into(),
            port: 3306,
            start_replication: true,
            force_start: false,
        };
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &request).await.unwrap();
        let decoded: TmRequest = read_frame(&mut server).await.unwrap();
        match decoded {
            TmRequest::SetSource {
                host,
                port,
                start_replication,
                force_start,
            } => {
                assert_eq!(host, "db1");
                assert_eq!(port, 3306);
                assert!(start_replication);
                assert!(!force_start);
            }
            other => panic!("wrong request decoded: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            // Hand-written corrupt length prefix.
            let _ = client.write_all(&(u32::MAX).to_be_bytes()).await;
        });
        let err = read_frame::<_, TmRequest>(&mut server).await.unwrap_err();
        assert!(matches!(err, TmcError::Wire(_)));
    }

    #[tokio::test]
    async fn test_tcp_client_round_trip_and_not_replica() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request: TmRequest = read_frame(&mut stream).await.unwrap();
                let response = match request {
                    TmRequest::ReadReparentJournalInfo => {
                        TmResponse::JournalInfo { term_counter: 7 }
                    }
                    TmRequest::StopReplicationAndGetStatus { .. } => TmResponse::Error {
                        not_replica: true,
                        message: "tablet is primary".into(),
                    },
                    _ => TmResponse::Ok,
                };
                write_frame(&mut stream, &response).await.unwrap();
            }
        });

        let mut tablet = Tablet::new(
            TabletAlias::new("zone1", 100),
            "commerce",
            "-",
            TabletRole::Replica,
        );
        tablet.hostname = addr.ip().to_string();
        tablet.agent_port = addr.port();

        let client = TcpTabletClient::new();
        let term = client
            .read_reparent_journal_info(&tablet, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(term, 7);

        let err = client
            .stop_replication_and_get_status(
                &tablet,
                StopReplicationMode::IoAndSqlThread,
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TmcError::NotReplica(_)));
    }
}
