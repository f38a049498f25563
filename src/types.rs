use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Wallet,
    Booking,
    Vehicle,
    Notification,
}

impl Target {
    pub const ALL: [Target; 4] = [
        Target::Wallet,
        Target::Booking,
        Target::Vehicle,
        Target::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Wallet => "wallet",
            Target::Booking => "booking",
            Target::Vehicle => "vehicle",
            Target::Notification => "notification",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshAction {
    Refresh,
    Notify,
    Other(String),
}

impl RefreshAction {
    fn from_wire(value: &str) -> Self {
        match value {
            "refresh" => RefreshAction::Refresh,
            "notify" => RefreshAction::Notify,
            other => RefreshAction::Other(other.to_string()),
        }
    }
}

// `/user/{id}/queue/refresh`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub action: String,
    pub target: String,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// `/topic/user/{id}`, `/topic/broadcast`, `/topic/channel/{name}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMessage {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Notification,
    NotificationRead,
    NotificationAllRead,
    DataUpdate,
    StatusChange,
    BookingUpdate,
    BookingStatusChange,
    PaymentUpdate,
    WalletUpdate,
    VehicleUpdate,
    SystemAlert,
    /// `ADMIN_RELOAD_<suffix>`; the suffix is kept verbatim.
    AdminReload(String),
    Other(String),
}

const ADMIN_RELOAD_PREFIX: &str = "ADMIN_RELOAD_";

impl EventKind {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "NOTIFICATION" => EventKind::Notification,
            "NOTIFICATION_READ" => EventKind::NotificationRead,
            "NOTIFICATION_ALL_READ" => EventKind::NotificationAllRead,
            "DATA_UPDATE" => EventKind::DataUpdate,
            "STATUS_CHANGE" => EventKind::StatusChange,
            "BOOKING_UPDATE" => EventKind::BookingUpdate,
            "BOOKING_STATUS_CHANGE" => EventKind::BookingStatusChange,
            "PAYMENT_UPDATE" => EventKind::PaymentUpdate,
            "WALLET_UPDATE" => EventKind::WalletUpdate,
            "VEHICLE_UPDATE" => EventKind::VehicleUpdate,
            "SYSTEM_ALERT" => EventKind::SystemAlert,
            other => match other.strip_prefix(ADMIN_RELOAD_PREFIX) {
                Some(suffix) => EventKind::AdminReload(suffix.to_string()),
                None => EventKind::Other(other.to_string()),
            },
        }
    }

    pub fn as_wire(&self) -> String {
        let fixed = match self {
            EventKind::Notification => "NOTIFICATION",
            EventKind::NotificationRead => "NOTIFICATION_READ",
            EventKind::NotificationAllRead => "NOTIFICATION_ALL_READ",
            EventKind::DataUpdate => "DATA_UPDATE",
            EventKind::StatusChange => "STATUS_CHANGE",
            EventKind::BookingUpdate => "BOOKING_UPDATE",
            EventKind::BookingStatusChange => "BOOKING_STATUS_CHANGE",
            EventKind::PaymentUpdate => "PAYMENT_UPDATE",
            EventKind::WalletUpdate => "WALLET_UPDATE",
            EventKind::VehicleUpdate => "VEHICLE_UPDATE",
            EventKind::SystemAlert => "SYSTEM_ALERT",
            EventKind::AdminReload(suffix) => return format!("{ADMIN_RELOAD_PREFIX}{suffix}"),
            EventKind::Other(other) => return other.clone(),
        };
        fixed.to_string()
    }

    pub fn target(&self) -> Option<Target> {
        match self {
            EventKind::Notification
            | EventKind::NotificationRead
            | EventKind::NotificationAllRead => Some(Target::Notification),
            EventKind::BookingUpdate | EventKind::BookingStatusChange => Some(Target::Booking),
            EventKind::PaymentUpdate | EventKind::WalletUpdate => Some(Target::Wallet),
            EventKind::VehicleUpdate => Some(Target::Vehicle),
            EventKind::DataUpdate
            | EventKind::StatusChange
            | EventKind::SystemAlert
            | EventKind::AdminReload(_)
            | EventKind::Other(_) => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshEnvelope {
    pub target: Target,
    pub action: RefreshAction,
    pub kind: String,
    pub user_id: Option<String>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Refresh(RefreshEnvelope),
    Event(RealtimeEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeShape {
    Refresh,
    Event,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown refresh target: {0}")]
    UnknownTarget(String),
}

impl Envelope {
    pub fn parse(shape: EnvelopeShape, body: &str) -> Result<Self, EnvelopeError> {
        match shape {
            EnvelopeShape::Refresh => {
                let msg: RefreshMessage = serde_json::from_str(body)?;
                let target = Target::from_wire(&msg.target)
                    .ok_or_else(|| EnvelopeError::UnknownTarget(msg.target.clone()))?;
                Ok(Envelope::Refresh(RefreshEnvelope {
                    target,
                    action: RefreshAction::from_wire(&msg.action),
                    kind: msg.kind,
                    user_id: msg.user_id,
                    message: msg.message,
                    data: msg.data,
                }))
            }
            EnvelopeShape::Event => {
                let msg: RealtimeMessage = serde_json::from_str(body)?;
                Ok(Envelope::Event(RealtimeEvent {
                    kind: EventKind::from_wire(&msg.event_type),
                    payload: msg.payload,
                    metadata: msg.metadata.unwrap_or_default(),
                    timestamp: msg.timestamp,
                }))
            }
        }
    }

    pub fn target(&self) -> Option<Target> {
        match self {
            Envelope::Refresh(refresh) => Some(refresh.target),
            Envelope::Event(event) => event.kind.target(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
