pub type Result<T> = std::result::Result<T, EndpointError>;

/// Struct to represent IO errors.
#[derive(Debug)]
pub struct IoErrorStruct {
    /// The type of IO error.
    error_type: String,

    /// The error message.
    msg: String,
}

/// Struct to represent installer package errors.
#[derive(Debug)]
pub struct PackageErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent signed configuration token errors.
#[derive(Debug)]
pub struct TokenErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent TLS errors.
#[derive(Debug)]
pub struct TlsErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent DNS forwarding errors.
#[derive(Debug)]
pub struct DnsErrorStruct {
    /// The error message.
    msg: String,
}

/// Enum to represent different types of endpoint errors.
#[derive(Debug)]
pub enum EndpointError {
    IoError(IoErrorStruct),
    PackageError(PackageErrorStruct),
    TokenError(TokenErrorStruct),
    TlsError(TlsErrorStruct),
    DnsError(DnsErrorStruct),
}

impl EndpointError {
    /// Create a new installer package error.
    ///
    /// # Arguments
    /// * `msg` - The error message.
    ///
    /// # Returns
    /// An `EndpointError` instance representing a package error.
    pub fn package_error(msg: &str) -> Self {
        EndpointError::PackageError(PackageErrorStruct {
            msg: msg.to_string(),
        })
    }

    /// Create a new signed configuration token error.
    pub fn token_error(msg: &str) -> Self {
        EndpointError::TokenError(TokenErrorStruct {
            msg: msg.to_string(),
        })
    }

    /// Create a new TLS error.
    pub fn tls_error(msg: &str) -> Self {
        EndpointError::TlsError(TlsErrorStruct {
            msg: msg.to_string(),
        })
    }

    /// Create a new DNS forwarding error.
    pub fn dns_error(msg: &str) -> Self {
        EndpointError::DnsError(DnsErrorStruct {
            msg: msg.to_string(),
        })
    }
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::IoError(io_err) => {
                write!(f, "IO {} Error: {}", io_err.error_type, io_err.msg)
            }
            EndpointError::PackageError(package_err) => {
                write!(f, "Package Error: {}", package_err.msg)
            }
            EndpointError::TokenError(token_err) => {
                write!(f, "Config Token Error: {}", token_err.msg)
            }
            EndpointError::TlsError(tls_err) => {
                write!(f, "TLS Error: {}", tls_err.msg)
            }
            EndpointError::DnsError(dns_err) => {
                write!(f, "DNS Error: {}", dns_err.msg)
            }
        }
    }
}

impl std::error::Error for EndpointError {}

impl From<std::io::Error> for EndpointError {
    fn from(error: std::io::Error) -> Self {
        EndpointError::IoError(IoErrorStruct {
            error_type: error.kind().to_string(),
            msg: error.to_string(),
        })
    }
}

impl From<jsonwebtoken::errors::Error> for EndpointError {
    fn from(error: jsonwebtoken::errors::Error) -> Self {
        EndpointError::TokenError(TokenErrorStruct {
            msg: error.to_string(),
        })
    }
}

impl From<serde_json::Error> for EndpointError {
    fn from(error: serde_json::Error) -> Self {
        EndpointError::TokenError(TokenErrorStruct {
            msg: error.to_string(),
        })
    }
}

impl From<rustls::Error> for EndpointError {
    fn from(error: rustls::Error) -> Self {
        EndpointError::TlsError(TlsErrorStruct {
            msg: error.to_string(),
        })
    }
}

impl From<rustls::pki_types::InvalidDnsNameError> for EndpointError {
    fn from(error: rustls::pki_types::InvalidDnsNameError) -> Self {
        EndpointError::TlsError(TlsErrorStruct {
            msg: error.to_string(),
        })
    }
}
