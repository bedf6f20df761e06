//! Error types.

use core::fmt;

/// Error codes carried inside an error response.
///
/// Codes 0-14 align with gRPC for familiarity; collaborators may use
/// anything above [`ErrorCode::RESERVED_MAX`] for application errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    Cancelled = 1,
    DeadlineExceeded = 2,
    InvalidArgument = 3,
    NotFound = 4,
    AlreadyExists = 5,
    PermissionDenied = 6,
    ResourceExhausted = 7,
    FailedPrecondition = 8,
    Aborted = 9,
    OutOfRange = 10,
    Unimplemented = 11,
    Internal = 12,
    Unavailable = 13,
    DataLoss = 14,
}

impl ErrorCode {
    /// Highest code reserved for the core; application codes start above it.
    pub const RESERVED_MAX: u32 = 99;

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::DeadlineExceeded),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::NotFound),
            5 => Some(Self::AlreadyExists),
            6 => Some(Self::PermissionDenied),
            7 => Some(Self::ResourceExhausted),
            8 => Some(Self::FailedPrecondition),
            9 => Some(Self::Aborted),
            10 => Some(Self::OutOfRange),
            11 => Some(Self::Unimplemented),
            12 => Some(Self::Internal),
            13 => Some(Self::Unavailable),
            14 => Some(Self::DataLoss),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Aborted => write!(f, "aborted"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DataLoss => write!(f, "data loss"),
        }
    }
}

/// An application-level failure carried in an error response frame.
///
/// The response carries no argument payload in this case, only the code and
/// a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub code: u32,
    pub message: String,
}

impl RuntimeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as u32,
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ErrorCode::from_u32(self.code) {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "code {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The body ended before the fields it promised.
    Truncated,
    /// Unknown frame kind tag.
    BadTag(u8),
    /// Frame length exceeds the configured maximum.
    TooLarge { len: usize, max: usize },
    /// A length-prefixed string was not valid UTF-8.
    BadString,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame body"),
            Self::BadTag(tag) => write!(f, "unknown frame tag {tag}"),
            Self::TooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
            Self::BadString => write!(f, "frame string is not valid UTF-8"),
        }
    }
}

impl std::error::Error for WireError {}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// Peer closed the connection (EOF on a frame boundary).
    Closed,
    Io(std::io::Error),
    Wire(WireError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Wire(e) => write!(f, "wire error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

/// Outcome of a request as seen by the caller.
#[derive(Debug)]
pub enum CallError {
    /// The carrying connection failed or was never established.
    Transport,
    /// The client binding is not in the Connected state.
    NotConnected,
    /// The peer answered with an error response instead of a result.
    Runtime(RuntimeError),
    /// The cooperative wait deadline elapsed.
    Timeout,
    /// Too many simultaneously outstanding requests; refused locally.
    Saturated,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport failure"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Runtime(e) => write!(f, "runtime error: {e}"),
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::Saturated => write!(f, "too many outstanding requests"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The target name is neither local nor known to the broker.
    NotFound,
    /// Brokerage is not enabled, or the broker itself is unreachable.
    BrokerUnavailable,
    /// Opening or using the socket failed.
    Transport,
    /// The blocking variant ran out of time.
    Timeout,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "service not found"),
            Self::BrokerUnavailable => write!(f, "broker unavailable"),
            Self::Transport => write!(f, "transport failure"),
            Self::Timeout => write!(f, "timed out connecting"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Errors from attaching an endpoint.
#[derive(Debug)]
pub enum AttachError {
    Parse(EndpointParseError),
    Bind(std::io::Error),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "bad endpoint: {e}"),
            Self::Bind(e) => write!(f, "bind failed: {e}"),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Bind(e) => Some(e),
        }
    }
}

impl From<EndpointParseError> for AttachError {
    fn from(e: EndpointParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<std::io::Error> for AttachError {
    fn from(e: std::io::Error) -> Self {
        Self::Bind(e)
    }
}

/// Endpoint specification parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
    /// No `scheme:` prefix.
    MissingScheme,
    UnknownScheme(String),
    EmptyAddress,
}

impl fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScheme => write!(f, "endpoint has no scheme prefix"),
            Self::UnknownScheme(s) => write!(f, "unknown endpoint scheme '{s}'"),
            Self::EmptyAddress => write!(f, "endpoint address is empty"),
        }
    }
}

impl std::error::Error for EndpointParseError {}
