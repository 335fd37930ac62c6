//! Message dictionary and command vocabulary

use crate::value::Value;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flow identifier, unique within one tunnel
pub type FlowId = u32;

/// Nested `configuration` dictionary delivered with network settings
pub type ConfigMap = BTreeMap<String, Value>;

/// Recognized dictionary keys.
pub mod keys {
    pub const COMMAND: &str = "command";
    pub const IDENTIFIER: &str = "identifier";
    pub const DATA: &str = "data";
    pub const CLOSE_TYPE: &str = "close-type";
    pub const RESULT_CODE: &str = "result-code";
    pub const TUNNEL_TYPE: &str = "tunnel-type";
    pub const APP_FLOW_TYPE: &str = "app-proxy-flow-type";
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const PACKETS: &str = "packets";
    pub const PROTOCOLS: &str = "protocols";
    pub const CONFIGURATION: &str = "configuration";
    pub const DNS_PACKET: &str = "dns-packet";
    pub const DNS_PACKET_SOURCE: &str = "dns-packet-source";
}

/// Message kinds carried in the `command` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Command {
    Data = 1,
    Suspend = 2,
    Resume = 3,
    Close = 4,
    Dns = 5,
    Open = 6,
    OpenResult = 7,
    Packets = 8,
    FetchConfiguration = 9,
}

impl TryFrom<i64> for Command {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Data),
            2 => Ok(Command::Suspend),
            3 => Ok(Command::Resume),
            4 => Ok(Command::Close),
            5 => Ok(Command::Dns),
            6 => Ok(Command::Open),
            7 => Ok(Command::OpenResult),
            8 => Ok(Command::Packets),
            9 => Ok(Command::FetchConfiguration),
            other => Err(other),
        }
    }
}

/// Half-close direction of a logical connection.
///
/// Doubles as the connection's close state: `None` is fully open, `All` is
/// fully closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i64)]
pub enum CloseDirection {
    #[default]
    None = 1,
    Read = 2,
    Write = 3,
    All = 4,
}

impl CloseDirection {
    /// Advance the close state by one more close request.
    ///
    /// Closing a different direction than the current partial close collapses
    /// to `All`, even when the two directions would not logically entail it;
    /// peers depend on this collapse.
    pub fn apply(self, direction: CloseDirection) -> CloseDirection {
        match (self, direction) {
            (current, CloseDirection::None) => current,
            (CloseDirection::All, _) | (_, CloseDirection::All) => CloseDirection::All,
            (CloseDirection::None, requested) => requested,
            (current, requested) if current == requested => current,
            _ => CloseDirection::All,
        }
    }

    pub fn closed_for_read(self) -> bool {
        matches!(self, CloseDirection::Read | CloseDirection::All)
    }

    pub fn closed_for_write(self) -> bool {
        matches!(self, CloseDirection::Write | CloseDirection::All)
    }
}

impl TryFrom<i64> for CloseDirection {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CloseDirection::None),
            2 => Ok(CloseDirection::Read),
            3 => Ok(CloseDirection::Write),
            4 => Ok(CloseDirection::All),
            other => Err(other),
        }
    }
}

/// Outcome of a flow open request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ResultCode {
    Success = 0,
    InvalidParameter = 1,
    NoSuchHost = 2,
    Refused = 3,
    Timeout = 4,
    InternalError = 5,
}

impl TryFrom<i64> for ResultCode {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResultCode::Success),
            1 => Ok(ResultCode::InvalidParameter),
            2 => Ok(ResultCode::NoSuchHost),
            3 => Ok(ResultCode::Refused),
            4 => Ok(ResultCode::Timeout),
            5 => Ok(ResultCode::InternalError),
            other => Err(other),
        }
    }
}

/// Layer of a flow: application-level byte/datagram relay, or raw IP packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TunnelKind {
    AppLayer = 0,
    IpLayer = 1,
}

impl TryFrom<i64> for TunnelKind {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TunnelKind::AppLayer),
            1 => Ok(TunnelKind::IpLayer),
            other => Err(other),
        }
    }
}

/// Sub-kind of an application-layer flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum AppFlowKind {
    Tcp = 1,
    Udp = 3,
}

impl TryFrom<i64> for AppFlowKind {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AppFlowKind::Tcp),
            3 => Ok(AppFlowKind::Udp),
            other => Err(other),
        }
    }
}

/// One tunnel message: a dictionary of string keys to [`Value`]s.
///
/// Constructors cover every message kind the protocol exchanges; the typed
/// accessors enforce the key-to-kind table and return `None` on a missing key
/// or mismatched kind alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Message(BTreeMap<String, Value>);

impl Message {
    pub fn new(command: Command) -> Self {
        let mut msg = Message(BTreeMap::new());
        msg.insert(keys::COMMAND, Value::Int(command as i64));
        msg
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    // ---- typed accessors ----

    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_int()
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key)?.as_bytes()
    }

    pub fn map(&self, key: &str) -> Option<&ConfigMap> {
        self.get(key)?.as_map()
    }

    /// Raw command value; `None` when absent or not an integer.
    pub fn raw_command(&self) -> Option<i64> {
        self.int(keys::COMMAND)
    }

    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.raw_command()?).ok()
    }

    pub fn identifier(&self) -> Option<FlowId> {
        FlowId::try_from(self.int(keys::IDENTIFIER)?).ok()
    }

    pub fn data(&self) -> Option<Bytes> {
        self.bytes(keys::DATA).map(Bytes::copy_from_slice)
    }

    /// Close direction; defaults to `All` when the key is missing or invalid.
    pub fn close_type(&self) -> CloseDirection {
        self.int(keys::CLOSE_TYPE)
            .and_then(|raw| CloseDirection::try_from(raw).ok())
            .unwrap_or(CloseDirection::All)
    }

    pub fn result_code(&self) -> Option<ResultCode> {
        ResultCode::try_from(self.int(keys::RESULT_CODE)?).ok()
    }

    pub fn tunnel_kind(&self) -> Option<TunnelKind> {
        TunnelKind::try_from(self.int(keys::TUNNEL_TYPE)?).ok()
    }

    pub fn app_flow_kind(&self) -> Option<AppFlowKind> {
        AppFlowKind::try_from(self.int(keys::APP_FLOW_TYPE)?).ok()
    }

    pub fn host(&self) -> Option<&str> {
        self.string(keys::HOST)
    }

    pub fn port(&self) -> Option<u16> {
        u16::try_from(self.int(keys::PORT)?).ok()
    }

    /// The raw IP packet batch; `None` when the list is absent or any element
    /// is not a byte string.
    pub fn packets(&self) -> Option<Vec<Bytes>> {
        self.get(keys::PACKETS)?
            .as_list()?
            .iter()
            .map(|value| value.as_bytes().map(Bytes::copy_from_slice))
            .collect()
    }

    pub fn protocols(&self) -> Option<&[i64]> {
        self.get(keys::PROTOCOLS)?.as_int_list()
    }

    pub fn configuration(&self) -> Option<&ConfigMap> {
        self.map(keys::CONFIGURATION)
    }

    // ---- constructors ----

    pub fn data_message(id: FlowId, payload: &[u8]) -> Self {
        Message::new(Command::Data)
            .with(keys::IDENTIFIER, Value::from(id))
            .with(keys::DATA, Value::from(payload))
    }

    /// Data message carrying a UDP peer endpoint.
    pub fn datagram_message(id: FlowId, payload: &[u8], host: &str, port: u16) -> Self {
        Message::data_message(id, payload)
            .with(keys::HOST, Value::from(host))
            .with(keys::PORT, Value::from(port))
    }

    pub fn suspend_message(id: FlowId) -> Self {
        Message::new(Command::Suspend).with(keys::IDENTIFIER, Value::from(id))
    }

    pub fn resume_message(id: FlowId) -> Self {
        Message::new(Command::Resume).with(keys::IDENTIFIER, Value::from(id))
    }

    pub fn close_message(id: FlowId, direction: CloseDirection) -> Self {
        Message::new(Command::Close)
            .with(keys::IDENTIFIER, Value::from(id))
            .with(keys::CLOSE_TYPE, Value::Int(direction as i64))
    }

    pub fn open_tcp_message(id: FlowId, host: &str, port: u16) -> Self {
        Message::new(Command::Open)
            .with(keys::IDENTIFIER, Value::from(id))
            .with(keys::TUNNEL_TYPE, Value::Int(TunnelKind::AppLayer as i64))
            .with(keys::APP_FLOW_TYPE, Value::Int(AppFlowKind::Tcp as i64))
            .with(keys::HOST, Value::from(host))
            .with(keys::PORT, Value::from(port))
    }

    pub fn open_udp_message(id: FlowId) -> Self {
        Message::new(Command::Open)
            .with(keys::IDENTIFIER, Value::from(id))
            .with(keys::TUNNEL_TYPE, Value::Int(TunnelKind::AppLayer as i64))
            .with(keys::APP_FLOW_TYPE, Value::Int(AppFlowKind::Udp as i64))
    }

    pub fn open_ip_message(id: FlowId) -> Self {
        Message::new(Command::Open)
            .with(keys::IDENTIFIER, Value::from(id))
            .with(keys::TUNNEL_TYPE, Value::Int(TunnelKind::IpLayer as i64))
    }

    pub fn open_result_message(id: FlowId, code: ResultCode) -> Self {
        Message::new(Command::OpenResult)
            .with(keys::IDENTIFIER, Value::from(id))
            .with(keys::RESULT_CODE, Value::Int(code as i64))
    }

    /// Successful open result carrying per-flow network settings.
    pub fn open_result_with_settings(id: FlowId, code: ResultCode, settings: ConfigMap) -> Self {
        Message::open_result_message(id, code).with(keys::CONFIGURATION, Value::Map(settings))
    }

    pub fn packets_message(id: FlowId, packets: &[Bytes], protocols: &[i64]) -> Self {
        let items = packets
            .iter()
            .map(|packet| Value::Bytes(packet.to_vec()))
            .collect();
        Message::new(Command::Packets)
            .with(keys::IDENTIFIER, Value::from(id))
            .with(keys::PACKETS, Value::List(items))
            .with(keys::PROTOCOLS, Value::IntList(protocols.to_vec()))
    }

    pub fn fetch_configuration_message() -> Self {
        Message::new(Command::FetchConfiguration)
    }

    pub fn configuration_response(settings: ConfigMap) -> Self {
        Message::new(Command::FetchConfiguration).with(keys::CONFIGURATION, Value::Map(settings))
    }
}
