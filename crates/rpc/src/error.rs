use models::{ConsistencyLevel, Endpoint, WriteType};

pub type Result<T> = std::result::Result<T, Error>;

/// Native-protocol exception codes. The numeric mapping is part of the
/// client wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u16)]
pub enum ExceptionCode {
    ServerError = 0x0000,
    ProtocolError = 0x000A,
    BadCredentials = 0x0100,
    Unavailable = 0x1000,
    Overloaded = 0x1001,
    IsBootstrapping = 0x1002,
    TruncateError = 0x1003,
    WriteTimeout = 0x1100,
    ReadTimeout = 0x1200,
    SyntaxError = 0x2000,
    Unauthorized = 0x2100,
    Invalid = 0x2200,
    ConfigError = 0x2300,
    AlreadyExists = 0x2400,
    Unprepared = 0x2500,
}

/// Errors surfaced by message dispatch and by coordinated operations.
///
/// Transport-level failures (closed connections, rpc timeouts) are treated
/// as peer death by dispatchers and are never logged to the user; the
/// semantic variants map one-to-one onto client errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("cannot achieve consistency level {cl}: {required} required, {alive} alive")]
    Unavailable {
        cl: ConsistencyLevel,
        required: usize,
        alive: usize,
    },
    #[error("write timeout at {cl}: {received} of {block_for} acknowledgements ({write_type})")]
    WriteTimeout {
        cl: ConsistencyLevel,
        received: usize,
        block_for: usize,
        write_type: WriteType,
    },
    #[error("read timeout at {cl}: {received} of {block_for} responses (data present: {data_present})")]
    ReadTimeout {
        cl: ConsistencyLevel,
        received: usize,
        block_for: usize,
        data_present: bool,
    },
    #[error("coordinator overloaded: {0}")]
    Overloaded(String),
    #[error("this node is bootstrapping and cannot coordinate requests")]
    IsBootstrapping,
    #[error("truncate failed: {0}")]
    TruncateError(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("features enabled in the cluster but missing locally: {0:?}")]
    FeatureIncompatible(Vec<String>),

    // Transport-level failures.
    #[error("connection to {0} closed")]
    ConnectionClosed(Endpoint),
    #[error("rpc to {0} timed out")]
    RpcTimeout(Endpoint),
    #[error("{0} is not reachable on this transport")]
    Unreachable(Endpoint),
    #[error("peer does not handle {0:?}")]
    Unimplemented(crate::Verb),
    #[error("{0}")]
    ServerError(String),
}

impl Error {
    pub fn code(&self) -> ExceptionCode {
        match self {
            Error::Unavailable { .. } => ExceptionCode::Unavailable,
            Error::WriteTimeout { .. } => ExceptionCode::WriteTimeout,
            Error::ReadTimeout { .. } => ExceptionCode::ReadTimeout,
            Error::Overloaded(_) => ExceptionCode::Overloaded,
            Error::IsBootstrapping => ExceptionCode::IsBootstrapping,
            Error::TruncateError(_) => ExceptionCode::TruncateError,
            Error::Invalid(_) => ExceptionCode::Invalid,
            Error::ConfigError(_) | Error::FeatureIncompatible(_) => ExceptionCode::ConfigError,
            Error::ConnectionClosed(_)
            | Error::RpcTimeout(_)
            | Error::Unreachable(_)
            | Error::Unimplemented(_)
            | Error::ServerError(_) => ExceptionCode::ServerError,
        }
    }

    /// Failures which mean the peer is unreachable rather than the request
    /// being wrong; dispatchers count these silently.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed(_) | Error::RpcTimeout(_) | Error::Unreachable(_)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_match_the_native_protocol() {
        assert_eq!(ExceptionCode::ServerError as u16, 0x0000);
        assert_eq!(ExceptionCode::ProtocolError as u16, 0x000A);
        assert_eq!(ExceptionCode::BadCredentials as u16, 0x0100);
        assert_eq!(ExceptionCode::Unavailable as u16, 0x1000);
        assert_eq!(ExceptionCode::Overloaded as u16, 0x1001);
        assert_eq!(ExceptionCode::IsBootstrapping as u16, 0x1002);
        assert_eq!(ExceptionCode::TruncateError as u16, 0x1003);
        assert_eq!(ExceptionCode::WriteTimeout as u16, 0x1100);
        assert_eq!(ExceptionCode::ReadTimeout as u16, 0x1200);
        assert_eq!(ExceptionCode::SyntaxError as u16, 0x2000);
        assert_eq!(ExceptionCode::Unauthorized as u16, 0x2100);
        assert_eq!(ExceptionCode::Invalid as u16, 0x2200);
        assert_eq!(ExceptionCode::ConfigError as u16, 0x2300);
        assert_eq!(ExceptionCode::AlreadyExists as u16, 0x2400);
        assert_eq!(ExceptionCode::Unprepared as u16, 0x2500);
    }

    #[test]
    fn transport_errors_are_classified() {
        let ep = Endpoint::parse("10.0.0.1").unwrap();
        assert!(Error::ConnectionClosed(ep).is_transport());
        assert!(Error::RpcTimeout(ep).is_transport());
        assert!(!Error::IsBootstrapping.is_transport());
    }
}
