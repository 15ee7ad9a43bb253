use std::collections::HashMap;

/// HTTP status codes emitted by the engine and common in handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok = 200,
    /// 201 Created
    Created = 201,
    /// 204 No Content
    NoContent = 204,
    /// 400 Bad Request
    BadRequest = 400,
    /// 404 Not Found
    NotFound = 404,
    /// 405 Method Not Allowed
    MethodNotAllowed = 405,
    /// 408 Request Timeout
    RequestTimeout = 408,
    /// 413 Content Too Large
    ContentTooLarge = 413,
    /// 414 URI Too Large
    UriTooLarge = 414,
    /// 431 Request Header Fields Too Large
    HeaderFieldsTooLarge = 431,
    /// 500 Internal Server Error
    InternalServerError = 500,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use lantern::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::RequestTimeout.as_u16(), 408);
    /// ```
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Returns the standard reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::NoContent => "No Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::ContentTooLarge => "Content Too Large",
            StatusCode::UriTooLarge => "URI Too Large",
            StatusCode::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// A complete HTTP response ready for serialization.
///
/// Header names are preserved as given; `Content-Length` is filled in from
/// the body when the caller did not set one.
#[derive(Debug)]
pub struct Response {
    /// The HTTP status code
    pub status: StatusCode,
    /// HTTP headers as key-value pairs, case preserved
    pub headers: HashMap<String, String>,
    /// Response body, if any
    pub body: Option<Vec<u8>>,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HashMap<String, String>,
    body: Option<Vec<u8>>,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Builds the final Response.
    ///
    /// Adds the Content-Length header from the body size when a body is set
    /// and the caller has not provided one.
    pub fn build(mut self) -> Response {
        if let Some(body) = &self.body {
            let has_length = self
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-length"));
            if !has_length {
                self.headers
                    .insert("Content-Length".to_string(), body.len().to_string());
            }
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// Creates a simple 200 OK response with the given body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        ResponseBuilder::new(StatusCode::Ok).body(body).build()
    }

    /// Creates a 500 Internal Server Error response.
    pub fn internal_error() -> Self {
        ResponseBuilder::new(StatusCode::InternalServerError)
            .header("Content-Type", "text/plain")
            .header("Connection", "close")
            .body(b"500 Internal Server Error".to_vec())
            .build()
    }

    /// Engine-emitted error response that also ends the connection.
    pub(crate) fn engine_error(status: StatusCode) -> Self {
        let body = format!("{} {}", status.as_u16(), status.reason_phrase());
        ResponseBuilder::new(status)
            .header("Content-Type", "text/plain")
            .header("Connection", "close")
            .body(body.into_bytes())
            .build()
    }
}

/// Conversion of user-callback return values into a [`Response`].
///
/// Strings become `200 OK` with `Content-Type: text/plain`; a `Response`
/// passes through untouched.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body(self.into_bytes())
            .build()
    }
}

impl IntoResponse for &str {
    fn into_response(self) -> Response {
        self.to_string().into_response()
    }
}
