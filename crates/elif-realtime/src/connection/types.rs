//! Connection identity, lifecycle status and transport kinds

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

/// Unique identifier for a logical connection.
///
/// 128 bits from the OS random source, hex encoded so it can travel in a
/// query string untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a connection.
///
/// A connection is `Active` while a transport request is attached to it and
/// `Inactive` between long-polling requests. `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Inactive,
    Active,
    Disposed,
}

impl ConnectionStatus {
    pub fn is_disposed(&self) -> bool {
        matches!(self, ConnectionStatus::Disposed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Inactive => write!(f, "Inactive"),
            ConnectionStatus::Active => write!(f, "Active"),
            ConnectionStatus::Disposed => write!(f, "Disposed"),
        }
    }
}

/// Transport carrying a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportType {
    /// Transports that keep a single request open for the connection's lifetime
    pub fn is_persistent(&self) -> bool {
        !matches!(self, TransportType::LongPolling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::WebSockets => "WebSockets",
            TransportType::ServerSentEvents => "ServerSentEvents",
            TransportType::LongPolling => "LongPolling",
        }
    }

    fn flag(&self) -> HttpTransports {
        match self {
            TransportType::WebSockets => HttpTransports::WEB_SOCKETS,
            TransportType::ServerSentEvents => HttpTransports::SERVER_SENT_EVENTS,
            TransportType::LongPolling => HttpTransports::LONG_POLLING,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "WebSockets" => Ok(TransportType::WebSockets),
            "ServerSentEvents" => Ok(TransportType::ServerSentEvents),
            "LongPolling" => Ok(TransportType::LongPolling),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Set of enabled transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpTransports(u8);

impl HttpTransports {
    pub const NONE: HttpTransports = HttpTransports(0);
    pub const WEB_SOCKETS: HttpTransports = HttpTransports(0b001);
    pub const SERVER_SENT_EVENTS: HttpTransports = HttpTransports(0b010);
    pub const LONG_POLLING: HttpTransports = HttpTransports(0b100);

    pub const fn all() -> Self {
        HttpTransports(0b111)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, transport: TransportType) -> bool {
        self.0 & transport.flag().0 != 0
    }

    /// Enabled transports in negotiation order
    pub fn transports(&self) -> Vec<TransportType> {
        [
            TransportType::WebSockets,
            TransportType::ServerSentEvents,
            TransportType::LongPolling,
        ]
        .into_iter()
        .filter(|t| self.contains(*t))
        .collect()
    }
}

impl Default for HttpTransports {
    fn default() -> Self {
        Self::all()
    }
}

impl BitOr for HttpTransports {
    type Output = HttpTransports;

    fn bitor(self, rhs: Self) -> Self::Output {
        HttpTransports(self.0 | rhs.0)
    }
}

impl From<TransportType> for HttpTransports {
    fn from(transport: TransportType) -> Self {
        transport.flag()
    }
}

impl FromStr for HttpTransports {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .try_fold(HttpTransports::NONE, |acc, part| {
                Ok(acc | part.parse::<TransportType>()?.flag())
            })
    }
}

impl Serialize for HttpTransports {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.transports())
    }
}

impl<'de> Deserialize<'de> for HttpTransports {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let transports = Vec::<TransportType>::deserialize(deserializer)?;
        Ok(transports
            .into_iter()
            .fold(HttpTransports::NONE, |acc, t| acc | t.flag()))
    }
}
