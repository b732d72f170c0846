//! Service exception reports.
//!
//! Servers answer failed requests with a `ServiceExceptionReport` (WMS) or an
//! `ows:ExceptionReport` (WMTS) instead of the requested image or document.

use crate::xml::XmlElement;
use wms_common::{WmsError, WmsResult};

pub const SERVICE_EXCEPTION_TITLE: &str = "Service Exception";

/// One exception of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceException {
    pub code: String,
    pub locator: Option<String>,
    pub message: String,
}

impl ServiceException {
    /// Explanation of the exception code followed by the server message.
    pub fn description(&self) -> String {
        let explanation = match self.code.as_str() {
            "InvalidFormat" => "Request contains a format not offered by the server.".to_string(),
            "InvalidCRS" => "Request contains a CRS not offered by the server for one or more of the Layers in the request.".to_string(),
            "InvalidSRS" => "Request contains a SRS not offered by the server for one or more of the Layers in the request.".to_string(),
            "LayerNotDefined" => "GetMap request is for a Layer not offered by the server, or GetFeatureInfo request is for a Layer not shown on the map.".to_string(),
            "StyleNotDefined" => "Request is for a Layer in a Style not offered by the server.".to_string(),
            "LayerNotQueryable" => "GetFeatureInfo request is applied to a Layer which is not declared queryable.".to_string(),
            "InvalidPoint" => "GetFeatureInfo request contains invalid X or Y value.".to_string(),
            "CurrentUpdateSequence" => "Value of (optional) UpdateSequence parameter in GetCapabilities request is equal to current value of service metadata update sequence number.".to_string(),
            "InvalidUpdateSequence" => "Value of (optional) UpdateSequence parameter in GetCapabilities request is greater than current value of service metadata update sequence number.".to_string(),
            "MissingDimensionValue" => "Request does not include a sample dimension value, and the server did not declare a default value for that dimension.".to_string(),
            "InvalidDimensionValue" => "Request contains an invalid sample dimension value.".to_string(),
            "OperationNotSupported" => "Request is for an optional operation that is not supported by the server.".to_string(),
            "" => "(No error code was reported)".to_string(),
            other => format!("{} (Unknown error code)", other),
        };
        format!("{}\nThe WMS vendor also reported: {}", explanation, self.message)
    }

    pub fn into_error(self) -> WmsError {
        WmsError::ServiceException {
            title: SERVICE_EXCEPTION_TITLE.to_string(),
            text: self.description(),
        }
    }
}

/// Whether the root element names an exception report.
pub fn is_exception_report(root: &XmlElement) -> bool {
    matches!(root.tag(), "ServiceExceptionReport" | "ows:ExceptionReport" | "ExceptionReport")
}

/// Parse every exception of a report.
///
/// A document that is not well formed yields a "Dom Exception" error.
pub fn parse_service_exception_report(xml: &[u8]) -> WmsResult<Vec<ServiceException>> {
    let text = String::from_utf8_lossy(xml);
    let root = XmlElement::parse(&text).map_err(|e| WmsError::ServiceException {
        title: "Dom Exception".to_string(),
        text: format!(
            "Could not get WMS Service Exception: {} at line {} column {}\n\nResponse was:\n\n{}",
            e.message, e.line, e.column, text
        ),
    })?;
    Ok(exceptions_of(&root))
}

pub(crate) fn exceptions_of(root: &XmlElement) -> Vec<ServiceException> {
    root.children
        .iter()
        .filter_map(|e| match e.tag() {
            "ServiceException" => Some(ServiceException {
                code: e.attr("code").unwrap_or_default().to_string(),
                locator: e.attr("locator").map(str::to_string),
                message: e.text().to_string(),
            }),
            "ows:Exception" | "Exception" => Some(ServiceException {
                code: e.attr("exceptionCode").unwrap_or_default().to_string(),
                locator: e.attr("locator").map(str::to_string),
                message: e
                    .children
                    .iter()
                    .filter(|t| t.local_name() == "ExceptionText")
                    .map(|t| t.text())
                    .collect::<Vec<_>>()
                    .join("\n"),
            }),
            _ => None,
        })
        .collect()
}

/// The error a response body reports, if it is a service exception report.
///
/// The last exception of the report wins.
pub fn service_exception_error(xml: &[u8]) -> Option<WmsError> {
    parse_service_exception_report(xml)
        .ok()?
        .pop()
        .map(ServiceException::into_error)
}
