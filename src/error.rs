/// Errors surfaced by the scan system and scan head APIs.
///
/// This is a closed set: every failure a public call can report maps to
/// exactly one variant. Variants that benefit from context carry a detail
/// string (serial numbers, offending values) appended to the canonical
/// message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("null value argument")]
    NullArgument,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("state not connected")]
    NotConnected,

    #[error("state connected")]
    Connected,

    #[error("state not scanning")]
    NotScanning,

    #[error("state scanning")]
    Scanning,

    #[error("versions not compatible: {0}")]
    VersionCompatibility(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no more room")]
    NoMoreRoom,

    #[error("network error: {0}")]
    Network(String),

    #[error("not discovered on network: {0}")]
    NotDiscovered(String),

    #[error("wrong function called, use Camera variant function")]
    UseCameraFunction,

    #[error("wrong function called, use Laser variant function")]
    UseLaserFunction,

    #[error("not supported with frame scanning")]
    FrameScanning,

    #[error("only supported with frame scanning")]
    NotFrameScanning,

    #[error("phase table not compatible with frame scanning")]
    FrameScanningInvalidPhaseTable,

    #[error("phase table empty")]
    PhaseTableEmpty,

    #[error("deprecated feature")]
    Deprecated,

    #[error("invalid scan system reference")]
    InvalidScanSystem,

    #[error("invalid scan head reference")]
    InvalidScanHead,

    #[error("unknown error")]
    Unknown,
}

impl Error {
    /// The stable negative integer code for this error kind, matching the
    /// return-code contract of the wire-compatible C client.
    pub fn code(&self) -> i32 {
        match self {
            Error::Internal(_) => -1,
            Error::NullArgument => -2,
            Error::InvalidArgument(_) => -3,
            Error::NotConnected => -4,
            Error::Connected => -5,
            Error::NotScanning => -6,
            Error::Scanning => -7,
            Error::VersionCompatibility(_) => -8,
            Error::AlreadyExists(_) => -9,
            Error::NoMoreRoom => -10,
            Error::Network(_) => -11,
            Error::NotDiscovered(_) => -12,
            Error::UseCameraFunction => -13,
            Error::UseLaserFunction => -14,
            Error::FrameScanning => -15,
            Error::NotFrameScanning => -16,
            Error::FrameScanningInvalidPhaseTable => -17,
            Error::PhaseTableEmpty => -18,
            Error::Deprecated => -19,
            Error::InvalidScanSystem => -20,
            Error::InvalidScanHead => -21,
            Error::Unknown => -22,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_negative() {
        let errors = [
            Error::Internal(String::new()),
            Error::NullArgument,
            Error::InvalidArgument(String::new()),
            Error::NotConnected,
            Error::Connected,
            Error::NotScanning,
            Error::Scanning,
            Error::VersionCompatibility(String::new()),
            Error::AlreadyExists(String::new()),
            Error::NoMoreRoom,
            Error::Network(String::new()),
            Error::NotDiscovered(String::new()),
            Error::UseCameraFunction,
            Error::UseLaserFunction,
            Error::FrameScanning,
            Error::NotFrameScanning,
            Error::FrameScanningInvalidPhaseTable,
            Error::PhaseTableEmpty,
            Error::Deprecated,
            Error::InvalidScanSystem,
            Error::InvalidScanHead,
            Error::Unknown,
        ];

        let mut seen = std::collections::BTreeSet::new();
        for e in &errors {
            assert!(e.code() < 0);
            assert!(seen.insert(e.code()), "duplicate code {}", e.code());
        }
    }

    #[test]
    fn network_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e: Error = io.into();
        assert_eq!(e.code(), -11);
    }
}
