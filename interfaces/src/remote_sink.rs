//! UDP Remote Sink
//!
//! Streams per-TTI scheduling summaries for the target UE to one external
//! consumer. Every datagram starts with a 4-byte preamble naming its kind;
//! all integers are little-endian.

use crate::InterfaceError;
use bytes::{BufMut, Bytes, BytesMut};
use common::{AggregatedTti, LinkDirection, Rnti, TtiSubscriber};
use nom::error::{Error as NomError, ErrorKind};
use nom::multi::count;
use nom::number::complete::{le_u16, le_u32, le_u64, le_u8};
use nom::IResult;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Data record preamble
pub const PREAMBLE_DATA: u32 = 0xAAAA_AAAA;
/// Cell configuration preamble
pub const PREAMBLE_CONFIG: u32 = 0xBBBB_BBBB;
/// Client connect request preamble
pub const PREAMBLE_CONNECT: u32 = 0xCCCC_CCCC;
/// Client disconnect preamble
pub const PREAMBLE_DISCONNECT: u32 = 0xFFFF_FFFF;

/// Version byte carried by data datagrams
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of an encoded data datagram
pub const DATA_DATAGRAM_LEN: usize = 4 + 1 + 1 + 8 + 2 + 2 + 4 + 1 + 4 + 1;

/// Scheduling summary of one cell and TTI for the target UE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRecord {
    pub cell: u8,
    pub timestamp_us: u64,
    pub tti: u16,
    pub rnti: u16,
    pub dl_tbs: u32,
    pub dl_retx: bool,
    pub ul_tbs: u32,
    pub ul_retx: bool,
}

impl DataRecord {
    /// One record per cell that has an entry for this TTI
    pub fn from_aggregated(agg: &AggregatedTti, target: Rnti) -> Vec<DataRecord> {
        agg.decoded()
            .map(|set| {
                let dl = set.find(target, LinkDirection::Downlink);
                let ul = set.find(target, LinkDirection::Uplink);
                DataRecord {
                    cell: set.cell.0,
                    timestamp_us: set.timestamp_us,
                    tti: agg.tti.value(),
                    rnti: target.value(),
                    dl_tbs: dl.map(|d| d.total_tbs()).unwrap_or(0),
                    dl_retx: dl.map(|d| d.retransmission).unwrap_or(false),
                    ul_tbs: ul.map(|d| d.total_tbs()).unwrap_or(0),
                    ul_retx: ul.map(|d| d.retransmission).unwrap_or(false),
                }
            })
            .collect()
    }
}

/// Cell configuration announced to a newly connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    /// Resource blocks of each monitored cell
    pub cell_prb: Vec<u8>,
    pub rnti: u16,
}

/// Datagrams exchanged with the remote consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Data(DataRecord),
    Config(ConfigRecord),
    ConnectRequest,
    Disconnect,
}

impl SinkMessage {
    /// Serialize to a datagram
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_DATAGRAM_LEN);
        match self {
            SinkMessage::Data(record) => {
                buf.put_u32_le(PREAMBLE_DATA);
                buf.put_u8(PROTOCOL_VERSION);
                buf.put_u8(record.cell);
                buf.put_u64_le(record.timestamp_us);
                buf.put_u16_le(record.tti);
                buf.put_u16_le(record.rnti);
                buf.put_u32_le(record.dl_tbs);
                buf.put_u8(record.dl_retx as u8);
                buf.put_u32_le(record.ul_tbs);
                buf.put_u8(record.ul_retx as u8);
            }
            SinkMessage::Config(config) => {
                buf.put_u32_le(PREAMBLE_CONFIG);
                buf.put_u8(config.cell_prb.len() as u8);
                for prb in &config.cell_prb {
                    buf.put_u8(*prb);
                }
                buf.put_u16_le(config.rnti);
            }
            SinkMessage::ConnectRequest => buf.put_u32_le(PREAMBLE_CONNECT),
            SinkMessage::Disconnect => buf.put_u32_le(PREAMBLE_DISCONNECT),
        }
        buf.freeze()
    }

    /// Parse one datagram
    pub fn parse(datagram: &[u8]) -> Result<Self, InterfaceError> {
        match parse_message(datagram) {
            Ok((_, message)) => Ok(message),
            Err(e) => Err(InterfaceError::InvalidMessage(format!("remote sink datagram: {:?}", e))),
        }
    }
}

fn parse_data(input: &[u8]) -> IResult<&[u8], DataRecord> {
    let (input, version) = le_u8(input)?;
    if version != PROTOCOL_VERSION {
        return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Verify)));
    }
    let (input, cell) = le_u8(input)?;
    let (input, timestamp_us) = le_u64(input)?;
    let (input, tti) = le_u16(input)?;
    let (input, rnti) = le_u16(input)?;
    let (input, dl_tbs) = le_u32(input)?;
    let (input, dl_retx) = le_u8(input)?;
    let (input, ul_tbs) = le_u32(input)?;
    let (input, ul_retx) = le_u8(input)?;

    Ok((input, DataRecord {
        cell,
        timestamp_us,
        tti,
        rnti,
        dl_tbs,
        dl_retx: dl_retx != 0,
        ul_tbs,
        ul_retx: ul_retx != 0,
    }))
}

fn parse_config(input: &[u8]) -> IResult<&[u8], ConfigRecord> {
    let (input, cells) = le_u8(input)?;
    let (input, cell_prb) = count(le_u8, cells as usize)(input)?;
    let (input, rnti) = le_u16(input)?;
    Ok((input, ConfigRecord { cell_prb, rnti }))
}

fn parse_message(input: &[u8]) -> IResult<&[u8], SinkMessage> {
    let (input, preamble) = le_u32(input)?;
    match preamble {
        PREAMBLE_DATA => {
            let (input, record) = parse_data(input)?;
            Ok((input, SinkMessage::Data(record)))
        }
        PREAMBLE_CONFIG => {
            let (input, config) = parse_config(input)?;
            Ok((input, SinkMessage::Config(config)))
        }
        PREAMBLE_CONNECT => Ok((input, SinkMessage::ConnectRequest)),
        PREAMBLE_DISCONNECT => Ok((input, SinkMessage::Disconnect)),
        _ => Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag))),
    }
}

/// Remote sink configuration
#[derive(Debug, Clone)]
pub struct RemoteSinkConfig {
    /// Local UDP address clients send their connect request to
    pub bind_addr: SocketAddr,
    /// UE whose grants are exported
    pub target: Rnti,
    /// Resource blocks of each monitored cell
    pub cell_prb: Vec<u8>,
}

/// Pipeline-side handle feeding the sink task
pub struct RemoteSinkHandle {
    tx: mpsc::Sender<AggregatedTti>,
    dropped: u64,
}

impl TtiSubscriber for RemoteSinkHandle {
    fn deliver(&mut self, tti: &AggregatedTti) {
        match self.tx.try_send(tti.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped % 1000 == 1 {
                    warn!("Remote sink lagging, {} TTIs dropped", self.dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Create the handle and the receiver the server task drains
pub fn channel(capacity: usize) -> (RemoteSinkHandle, mpsc::Receiver<AggregatedTti>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RemoteSinkHandle { tx, dropped: 0 }, rx)
}

/// UDP server serving a single connected client
pub struct RemoteSinkServer {
    socket: UdpSocket,
    config: RemoteSinkConfig,
    client: Option<SocketAddr>,
    records_sent: u64,
}

impl RemoteSinkServer {
    /// Bind the UDP socket
    pub async fn bind(config: RemoteSinkConfig) -> Result<Self, InterfaceError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("Remote sink listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            config,
            client: None,
            records_sent: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, InterfaceError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until every pipeline handle is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<AggregatedTti>) -> Result<(), InterfaceError> {
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = received?;
                    self.handle_control(&buf[..len], addr).await;
                }
                agg = rx.recv() => match agg {
                    Some(agg) => self.forward(&agg).await,
                    None => break,
                }
            }
        }

        info!("Remote sink stopped after {} records", self.records_sent);
        Ok(())
    }

    async fn handle_control(&mut self, datagram: &[u8], addr: SocketAddr) {
        match SinkMessage::parse(datagram) {
            Ok(SinkMessage::ConnectRequest) => {
                info!("Remote sink client connected from {}", addr);
                self.client = Some(addr);
                let config = SinkMessage::Config(ConfigRecord {
                    cell_prb: self.config.cell_prb.clone(),
                    rnti: self.config.target.value(),
                });
                if let Err(e) = self.socket.send_to(&config.encode(), addr).await {
                    warn!("Failed to send configuration to {}: {}", addr, e);
                }
            }
            Ok(SinkMessage::Disconnect) => {
                if self.client == Some(addr) {
                    info!("Remote sink client {} disconnected", addr);
                    self.client = None;
                }
            }
            Ok(other) => debug!("Ignoring unexpected datagram from {}: {:?}", addr, other),
            Err(e) => warn!("Malformed datagram from {}: {}", addr, e),
        }
    }

    async fn forward(&mut self, agg: &AggregatedTti) {
        let Some(client) = self.client else {
            return;
        };
        for record in DataRecord::from_aggregated(agg, self.config.target) {
            match self.socket.send_to(&SinkMessage::Data(record).encode(), client).await {
                Ok(_) => self.records_sent += 1,
                Err(e) => warn!("Failed to send record to {}: {}", client, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CellIndex, DciCandidate, DciFormat, SubframeDciSet, TransportBlock, Tti};
    use std::time::Duration;

    fn grant(rnti: u16, format: DciFormat, tbs: u32, retx: bool) -> DciCandidate {
        DciCandidate {
            format,
            rnti: Rnti(rnti),
            aggregation_level: 1,
            ncce: 4,
            prb_count: 6,
            harq_id: 3,
            tb: [TransportBlock { mcs: 9, rv: 0, tbs, ndi: false }, TransportBlock::default()],
            decode_prob: 0.95,
            correlation: 0.9,
            direction: format.direction(),
            retransmission: retx,
        }
    }

    #[test]
    fn test_data_datagram_layout() {
        let record = DataRecord {
            cell: 1,
            timestamp_us: 0x0102030405060708,
            tti: 10239,
            rnti: 1234,
            dl_tbs: 5000,
            dl_retx: true,
            ul_tbs: 200,
            ul_retx: false,
        };
        let bytes = SinkMessage::Data(record).encode();
        assert_eq!(bytes.len(), DATA_DATAGRAM_LEN);
        assert_eq!(&bytes[..4], &[0xAA; 4]);
        assert_eq!(bytes[4], PROTOCOL_VERSION);
        assert_eq!(SinkMessage::parse(&bytes).unwrap(), SinkMessage::Data(record));
    }

    #[test]
    fn test_config_and_control_parsing() {
        let config = SinkMessage::Config(ConfigRecord { cell_prb: vec![100, 50], rnti: 77 });
        let bytes = config.encode();
        assert_eq!(&bytes[..4], &[0xBB; 4]);
        assert_eq!(bytes[4], 2);
        assert_eq!(SinkMessage::parse(&bytes).unwrap(), config);

        assert_eq!(SinkMessage::parse(&[0xCC; 4]).unwrap(), SinkMessage::ConnectRequest);
        assert_eq!(SinkMessage::parse(&[0xFF; 4]).unwrap(), SinkMessage::Disconnect);
        assert!(SinkMessage::parse(&[0x12, 0x34, 0x56, 0x78]).is_err());
        assert!(SinkMessage::parse(&[0xAA, 0xAA]).is_err());
    }

    #[test]
    fn test_records_from_aggregated_tti() {
        let mut set = SubframeDciSet::new(CellIndex(0), Tti::new(7), 100, 99);
        set.push(grant(1234, DciFormat::Format1A, 4000, true));
        set.push(grant(1234, DciFormat::Format0, 300, false));
        set.push(grant(555, DciFormat::Format1, 9999, false));
        let agg = AggregatedTti { tti: Tti::new(7), cells: vec![Some(set), None] };

        let records = DataRecord::from_aggregated(&agg, Rnti(1234));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].dl_tbs, 4000);
        assert!(records[0].dl_retx);
        assert_eq!(records[0].ul_tbs, 300);
        assert_eq!(records[0].timestamp_us, 99);
    }

    #[tokio::test]
    async fn test_sink_serves_connected_client() {
        let config = RemoteSinkConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            target: Rnti(1234),
            cell_prb: vec![50],
        };
        let server = RemoteSinkServer::bind(config).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (mut handle, rx) = channel(8);
        let task = tokio::spawn(server.run(rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&SinkMessage::ConnectRequest.encode(), server_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            SinkMessage::parse(&buf[..len]).unwrap(),
            SinkMessage::Config(ConfigRecord { cell_prb: vec![50], rnti: 1234 })
        );

        let mut set = SubframeDciSet::new(CellIndex(0), Tti::new(42), 50, 1);
        set.push(grant(1234, DciFormat::Format1A, 1500, false));
        handle.deliver(&AggregatedTti { tti: Tti::new(42), cells: vec![Some(set)] });

        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match SinkMessage::parse(&buf[..len]).unwrap() {
            SinkMessage::Data(record) => {
                assert_eq!(record.tti, 42);
                assert_eq!(record.dl_tbs, 1500);
            }
            other => panic!("unexpected datagram {:?}", other),
        }

        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
    }
}
