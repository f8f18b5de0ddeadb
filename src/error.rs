/// Domain error taxonomy. The transport adapter maps each variant to an
/// HTTP status code via [`Error::status_code`]; everything that is not a
/// client mistake collapses into `Internal`.
///
/// Variants carry plain `String` payloads so tickets handed out by the
/// processing queue can clone a job's outcome to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid path, malformed filter JSON, non-numeric integer parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Path traversal escaping the media root.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Missing file or unknown index entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Image decode failure while building a derivative.
    #[error("cannot process image: {0}")]
    InvalidImage(String),

    /// Everything else. The message is for logs; transports serve a
    /// generic body outside dev mode.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::InvalidImage(_) => 422,
            Error::Internal(_) => 500,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(err.to_string())
        } else {
            Error::Internal(err.to_string())
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::Forbidden("x".into()).status_code(), 403);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::InvalidImage("x".into()).status_code(), 422);
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(io).status_code(), 404);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(Error::from(io).status_code(), 500);
    }
}
