//! Error types for the WMS/WMTS client.

use thiserror::Error;

/// Result type alias using WmsError.
pub type WmsResult<T> = Result<T, WmsError>;

/// Primary error type for WMS operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WmsError {
    // === Protocol Errors ===
    /// A ServiceExceptionReport returned by the server.
    #[error("{text}")]
    ServiceException { title: String, text: String },

    /// The capabilities document could not be used.
    #[error("{text}")]
    Capabilities {
        title: String,
        format: String,
        text: String,
    },

    #[error("HTTP status {status}: {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("Returned content type {content_type} is not an image")]
    UnexpectedContent { content_type: String, url: String },

    // === Configuration Errors ===
    #[error("Invalid provider URI: {0}")]
    InvalidUri(String),

    #[error("Number of layers and styles don't match")]
    LayerStyleMismatch,

    #[error("Number of tile layers must be one")]
    TileLayerCount,

    #[error("Tile layer or tile matrix set not found")]
    TileLayerNotFound,

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Invalid CRS: {0}")]
    InvalidCrs(String),

    #[error("Invalid layer order: {0}")]
    InvalidLayerOrder(String),

    #[error("Format not supported")]
    UnsupportedFormat,

    #[error("Context not fully specified (extent was defined but width and/or height was not).")]
    ContextNotSpecified,

    #[error("Provider is not valid: {0}")]
    InvalidProvider(String),

    // === Transport Errors ===
    #[error("{0}")]
    Transport(String),

    #[error("Redirect loop detected: {0}")]
    RedirectLoop(String),

    #[error("Request timeout")]
    Timeout,

    // === Decode Errors ===
    #[error("Returned image is flawed [Content-Type: {content_type}; URL: {url}]")]
    ImageDecode { content_type: String, url: String },

    #[error("Result parsing failed: {0}")]
    FeatureDecode(String),

    // === Rendering Errors ===
    #[error("current view would need {needed} tiles. tile request per draw limited to {limit}.")]
    TooManyTiles { needed: usize, limit: usize },

    #[error("Request cancelled")]
    Cancelled,
}

impl WmsError {
    /// Caption shown alongside the error text.
    pub fn error_title(&self) -> &str {
        match self {
            WmsError::ServiceException { title, .. } | WmsError::Capabilities { title, .. } => {
                title
            }
            WmsError::HttpStatus { .. }
            | WmsError::Transport(_)
            | WmsError::RedirectLoop(_)
            | WmsError::Timeout => "Network error",
            WmsError::UnexpectedContent { .. } | WmsError::ImageDecode { .. } => "Tile request error",
            WmsError::FeatureDecode(_) => "Identify error",
            _ => "WMS provider error",
        }
    }

    /// MIME type of the error text.
    pub fn error_format(&self) -> &str {
        match self {
            WmsError::Capabilities { format, .. } => format,
            _ => "text/plain",
        }
    }

    /// Error raised for unusable capabilities documents.
    pub fn capabilities(title: impl Into<String>, text: impl Into<String>) -> Self {
        WmsError::Capabilities {
            title: title.into(),
            format: "text/plain".to_string(),
            text: text.into(),
        }
    }

    /// Whether a failed tile request may be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WmsError::Transport(_) | WmsError::Timeout)
    }
}

impl From<crate::bbox::BboxParseError> for WmsError {
    fn from(err: crate::bbox::BboxParseError) -> Self {
        WmsError::InvalidUri(err.to_string())
    }
}

impl From<crate::crs::CrsParseError> for WmsError {
    fn from(err: crate::crs::CrsParseError) -> Self {
        WmsError::InvalidCrs(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_titles() {
        let err = WmsError::ServiceException {
            title: "Service Exception".into(),
            text: "boom".into(),
        };
        assert_eq!(err.error_title(), "Service Exception");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(WmsError::TileLayerCount.error_title(), "WMS provider error");
        assert_eq!(WmsError::Timeout.error_title(), "Network error");
    }

    #[test]
    fn test_capabilities_format() {
        let err = WmsError::Capabilities {
            title: "Dom Exception".into(),
            format: "text/html".into(),
            text: "<html></html>".into(),
        };
        assert_eq!(err.error_format(), "text/html");
        assert_eq!(WmsError::capabilities("t", "x").error_format(), "text/plain");
    }

    #[test]
    fn test_too_many_tiles_message() {
        let err = WmsError::TooManyTiles {
            needed: 300,
            limit: 256,
        };
        assert_eq!(
            err.to_string(),
            "current view would need 300 tiles. tile request per draw limited to 256."
        );
        assert!(!err.is_retryable());
        assert!(WmsError::Transport("reset".into()).is_retryable());
    }
}
