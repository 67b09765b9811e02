use thiserror::Error;

pub const TRANSPORT_CONNECTION_REFUSED: i32 = -1;
pub const TRANSPORT_CONNECTION_LOST: i32 = -5;
pub const TRANSPORT_READ_TIMEOUT: i32 = -11;

pub const HTTP_OK: i32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("NO_NETWORK")]
    NoNetwork,
    #[error("BAD_URL")]
    MalformedUrl,
    #[error("HTTP_FAILED ({0})")]
    TransportFailure(i32),
    #[error("HTTP_ERROR ({0})")]
    HttpFailure(i32),
    #[error("NOT_FOUND ({0})")]
    Redirected(i32),
    #[error("NO_ACCESS ({0})")]
    NotAuthorized(i32),
    #[error("VERSION_CHECK_FAILED")]
    VersionCheckFailed,
    #[error("UPDATE_FAILED ({code}: {message})")]
    UpdateFailed { code: i32, message: String },
    #[error("NO_UPDATES")]
    NoUpdateAvailable,
    #[error("SPIFF_FAILED")]
    StorageUnavailable,
    #[error("FILE_OPEN_ERROR")]
    FileOpenError,
    #[error("FILE_WRITE_ERROR")]
    FileWriteError,
    #[error("FILE_TOO_LARGE")]
    FileTooLarge,
    #[error("JSON_PARSE_ERROR")]
    ConfigParseError,
    #[error("TLS_CERTIFICATE_FAILED")]
    CertificateMissing,
}

impl ErrorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::NoNetwork => "NO_NETWORK",
            Self::MalformedUrl => "BAD_URL",
            Self::TransportFailure(_) => "HTTP_FAILED",
            Self::HttpFailure(_) => "HTTP_ERROR",
            Self::Redirected(_) => "NOT_FOUND",
            Self::NotAuthorized(_) => "NO_ACCESS",
            Self::VersionCheckFailed => "VERSION_CHECK_FAILED",
            Self::UpdateFailed { .. } => "UPDATE_FAILED",
            Self::NoUpdateAvailable => "NO_UPDATES",
            Self::StorageUnavailable => "SPIFF_FAILED",
            Self::FileOpenError => "FILE_OPEN_ERROR",
            Self::FileWriteError => "FILE_WRITE_ERROR",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::ConfigParseError => "JSON_PARSE_ERROR",
            Self::CertificateMissing => "TLS_CERTIFICATE_FAILED",
        }
    }

    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::TransportFailure(code)
            | Self::HttpFailure(code)
            | Self::Redirected(code)
            | Self::NotAuthorized(code) => Some(*code),
            Self::UpdateFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn blocks_provisioning(&self) -> bool {
        matches!(self, Self::StorageUnavailable | Self::CertificateMissing)
    }
}

pub fn classify_status(status: i32) -> Result<(), ErrorKind> {
    match status {
        HTTP_OK => Ok(()),
        s if s <= 0 => Err(ErrorKind::TransportFailure(s)),
        300..=399 => Err(ErrorKind::Redirected(status)),
        401 | 403 => Err(ErrorKind::NotAuthorized(status)),
        _ => Err(ErrorKind::HttpFailure(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_200_is_success() {
        assert_eq!(classify_status(200), Ok(()));
        assert_eq!(classify_status(204), Err(ErrorKind::HttpFailure(204)));
    }

    #[test]
    fn redirects_are_failures() {
        assert_eq!(classify_status(301), Err(ErrorKind::Redirected(301)));
        assert_eq!(classify_status(304), Err(ErrorKind::Redirected(304)));
        assert_eq!(classify_status(399), Err(ErrorKind::Redirected(399)));
    }

    #[test]
    fn non_positive_status_is_transport_failure() {
        assert_eq!(
            classify_status(TRANSPORT_CONNECTION_REFUSED),
            Err(ErrorKind::TransportFailure(-1))
        );
        assert_eq!(classify_status(0), Err(ErrorKind::TransportFailure(0)));
    }

    #[test]
    fn access_failures() {
        assert_eq!(classify_status(403), Err(ErrorKind::NotAuthorized(403)));
        assert_eq!(classify_status(404), Err(ErrorKind::HttpFailure(404)));
        assert_eq!(classify_status(500), Err(ErrorKind::HttpFailure(500)));
    }

    #[test]
    fn tags_and_codes() {
        let err = ErrorKind::TransportFailure(-11);
        assert_eq!(err.tag(), "HTTP_FAILED");
        assert_eq!(err.status_code(), Some(-11));
        assert_eq!(ErrorKind::FileTooLarge.status_code(), None);
        assert!(ErrorKind::CertificateMissing.blocks_provisioning());
        assert!(!ErrorKind::ConfigParseError.blocks_provisioning());
    }
}
