//! Error type for admission decisions
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

/// HTTP status returned for shed requests.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// HTTP status returned once the controller has shut down.
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Outcome of a request that did not reach, or failed inside, the wrapped service.
///
/// `E` is the wrapped service's error. [`crate::AdmissionController::admit`] never
/// runs a service and uses the default `Infallible`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError<E = Infallible> {
    /// Too many requests were already waiting
    CapacityExceeded { bucket: String, waiting: usize, max: usize },
    /// No quota arrived within the admission timeout
    Timeout { bucket: String, waited: Duration, timeout: Duration },
    /// The controller was shut down
    Closed,
    /// The wrapped service failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { bucket, waiting, max } => {
                write!(f, "too many requests waiting for '{}' ({} waiting, max {})", bucket, waiting, max)
            }
            Self::Timeout { bucket, waited, timeout } => {
                write!(
                    f,
                    "no quota for '{}' after {:?} (limit: {:?})",
                    bucket, waited, timeout
                )
            }
            Self::Closed => write!(f, "admission controller is shut down"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl AdmissionError<Infallible> {
    /// Re-type an admission-only error for use alongside a service error.
    pub fn widen<E>(self) -> AdmissionError<E> {
        match self {
            Self::CapacityExceeded { bucket, waiting, max } => {
                AdmissionError::CapacityExceeded { bucket, waiting, max }
            }
            Self::Timeout { bucket, waited, timeout } => {
                AdmissionError::Timeout { bucket, waited, timeout }
            }
            Self::Closed => AdmissionError::Closed,
            Self::Inner(never) => match never {},
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if the waitlist was full
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
    /// Check if the request timed out waiting for quota
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
    /// Check if the controller was shut down
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
    /// Check if the request was shed without reaching the wrapped service.
    pub fn is_rejected(&self) -> bool {
        self.is_capacity_exceeded() || self.is_timeout()
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Bucket the request was classified into, for rejections.
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Self::CapacityExceeded { bucket, .. } | Self::Timeout { bucket, .. } => Some(bucket),
            _ => None,
        }
    }
    /// Access waitlist occupancy as (waiting, max).
    pub fn capacity_details(&self) -> Option<(usize, usize)> {
        match self {
            Self::CapacityExceeded { waiting, max, .. } => Some((*waiting, *max)),
            _ => None,
        }
    }
    /// Access timeout details as (waited, timeout).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { waited, timeout, .. } => Some((*waited, *timeout)),
            _ => None,
        }
    }
    /// Status code an HTTP front end should answer with; `None` for inner errors.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::CapacityExceeded { .. } | Self::Timeout { .. } => Some(TOO_MANY_REQUESTS),
            Self::Closed => Some(SERVICE_UNAVAILABLE),
            Self::Inner(_) => None,
        }
    }
    /// Transform the inner error.
    pub fn map_inner<F, M>(self, map: M) -> AdmissionError<F>
    where
        M: FnOnce(E) -> F,
    {
        match self {
            Self::CapacityExceeded { bucket, waiting, max } => {
                AdmissionError::CapacityExceeded { bucket, waiting, max }
            }
            Self::Timeout { bucket, waited, timeout } => {
                AdmissionError::Timeout { bucket, waited, timeout }
            }
            Self::Closed => AdmissionError::Closed,
            Self::Inner(e) => AdmissionError::Inner(map(e)),
        }
    }
}

#[cfg(feature = "http")]
impl<E> AdmissionError<E> {
    /// Response for a shed request, with the message as a plain-text body.
    /// `None` for inner errors, which belong to the wrapped service.
    pub fn rejection_response<B>(&self) -> Option<http::Response<B>>
    where
        E: fmt::Display,
        B: From<String>,
    {
        let status = self.http_status()?;
        Some(self.render(status))
    }

    /// Answer a shed request with its status response; inner errors come back
    /// as `Err` for the caller to handle.
    pub fn into_response<B>(self) -> Result<http::Response<B>, E>
    where
        E: fmt::Display,
        B: From<String>,
    {
        match self.http_status() {
            Some(status) => Ok(self.render(status)),
            None => match self {
                Self::Inner(e) => Err(e),
                other => Ok(other.render(SERVICE_UNAVAILABLE)),
            },
        }
    }

    fn render<B>(&self, status: u16) -> http::Response<B>
    where
        E: fmt::Display,
        B: From<String>,
    {
        let mut response = http::Response::new(B::from(self.to_string()));
        *response.status_mut() =
            http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::SERVICE_UNAVAILABLE);
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
