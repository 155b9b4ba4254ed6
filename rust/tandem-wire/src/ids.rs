use serde::{Deserialize, Serialize};
use std::fmt;

/// Addresses one call of one service.
///
/// Identifiers are known statically on both sides and never generated at
/// runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceCallId {
    pub service_id: String,
    pub call_id: String,
}

impl ServiceCallId {
    pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for ServiceCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_id, self.call_id)
    }
}

/// Per-connection reference of one in-flight call.
///
/// Allocated by the side that initiates the call and echoed by the other side
/// in every frame of that call. Each side allocates from its own counter; the
/// frame direction tells which side's reference it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallRef(pub u32);

impl fmt::Display for CallRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallShape {
    /// Single request, single response.
    Single,
    /// Client stream in, single response out.
    ColdUpstream,
    /// Single request in, server stream out.
    ColdDownstream,
    /// Independent streams in both directions.
    ColdBistream,
}

impl CallShape {
    /// Whether the caller streams elements to the callee.
    pub fn has_upstream(self) -> bool {
        matches!(self, CallShape::ColdUpstream | CallShape::ColdBistream)
    }

    /// Whether the callee streams elements back to the caller.
    pub fn has_downstream(self) -> bool {
        matches!(self, CallShape::ColdDownstream | CallShape::ColdBistream)
    }

    /// Whether the call ends with a single `Response` frame.
    pub fn has_response(self) -> bool {
        !self.has_downstream()
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallShape::Single => write!(f, "single"),
            CallShape::ColdUpstream => write!(f, "cold-upstream"),
            CallShape::ColdDownstream => write!(f, "cold-downstream"),
            CallShape::ColdBistream => write!(f, "cold-bistream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_have_the_right_directions() {
        assert!(!CallShape::Single.has_upstream());
        assert!(!CallShape::Single.has_downstream());
        assert!(CallShape::Single.has_response());

        assert!(CallShape::ColdUpstream.has_upstream());
        assert!(CallShape::ColdUpstream.has_response());

        assert!(CallShape::ColdDownstream.has_downstream());
        assert!(!CallShape::ColdDownstream.has_response());

        assert!(CallShape::ColdBistream.has_upstream());
        assert!(CallShape::ColdBistream.has_downstream());
        assert!(!CallShape::ColdBistream.has_response());
    }

    #[test]
    fn call_id_display() {
        let id = ServiceCallId::new("echo", "ping");
        assert_eq!(id.to_string(), "echo.ping");
    }
}
