pub type Result<T> = std::result::Result<T, GatewayError>;

/// Struct to represent IO errors.
#[derive(Debug)]
pub struct IoErrorStruct {
    /// The type of IO error.
    error_type: String,

    /// The error message.
    msg: String,
}

/// Struct to represent TLS setup and handshake errors.
#[derive(Debug)]
pub struct TlsErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent registry file errors.
#[derive(Debug)]
pub struct RegistryErrorStruct {
    /// The registry file the error originated from.
    file: String,

    /// The error message.
    msg: String,
}

/// Struct to represent DNS wire format errors.
#[derive(Debug)]
pub struct DnsErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent DoH upstream errors.
#[derive(Debug)]
pub struct UpstreamErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent client authentication errors.
#[derive(Debug)]
pub struct AuthErrorStruct {
    /// The error message.
    msg: String,
}

/// Enum to represent different types of gateway errors.
#[derive(Debug)]
pub enum GatewayError {
    IoError(IoErrorStruct),
    TlsError(TlsErrorStruct),
    RegistryError(RegistryErrorStruct),
    DnsError(DnsErrorStruct),
    UpstreamError(UpstreamErrorStruct),
    AuthError(AuthErrorStruct),
}

impl GatewayError {
    /// Create a new TLS error.
    ///
    /// # Arguments
    /// * `msg` - The error message.
    ///
    /// # Returns
    /// A `GatewayError` instance representing a TLS error.
    pub fn tls_error(msg: &str) -> Self {
        GatewayError::TlsError(TlsErrorStruct {
            msg: msg.to_string(),
        })
    }

    /// Create a new registry error for the given registry file.
    pub fn registry_error(file: &str, msg: String) -> Self {
        GatewayError::RegistryError(RegistryErrorStruct {
            file: file.to_string(),
            msg,
        })
    }

    /// Create a new client authentication error.
    pub fn auth_error(msg: &str) -> Self {
        GatewayError::AuthError(AuthErrorStruct {
            msg: msg.to_string(),
        })
    }

    /// Create a new DNS wire format error.
    pub fn dns_error(msg: &str) -> Self {
        GatewayError::DnsError(DnsErrorStruct {
            msg: msg.to_string(),
        })
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::IoError(io_err) => {
                write!(f, "IO {} Error: {}", io_err.error_type, io_err.msg)
            }
            GatewayError::TlsError(tls_err) => {
                write!(f, "TLS Error: {}", tls_err.msg)
            }
            GatewayError::RegistryError(registry_err) => {
                write!(
                    f,
                    "Registry Error in {}: {}",
                    registry_err.file, registry_err.msg
                )
            }
            GatewayError::DnsError(dns_err) => {
                write!(f, "DNS Error: {}", dns_err.msg)
            }
            GatewayError::UpstreamError(upstream_err) => {
                write!(f, "Upstream Error: {}", upstream_err.msg)
            }
            GatewayError::AuthError(auth_err) => {
                write!(f, "Auth Error: {}", auth_err.msg)
            }
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(error: std::io::Error) -> Self {
        GatewayError::IoError(IoErrorStruct {
            error_type: error.kind().to_string(),
            msg: error.to_string(),
        })
    }
}

impl From<rustls::Error> for GatewayError {
    fn from(error: rustls::Error) -> Self {
        GatewayError::TlsError(TlsErrorStruct {
            msg: error.to_string(),
        })
    }
}

impl From<hickory_proto::ProtoError> for GatewayError {
    fn from(error: hickory_proto::ProtoError) -> Self {
        GatewayError::DnsError(DnsErrorStruct {
            msg: error.to_string(),
        })
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        GatewayError::UpstreamError(UpstreamErrorStruct {
            msg: error.to_string(),
        })
    }
}
