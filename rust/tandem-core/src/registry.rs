//! Services and the registry the node dispatches incoming calls through.

use std::collections::HashMap;

use tandem_wire::ServiceCallId;

use crate::descriptor::CallDescriptor;

/// A named group of calls.
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    service_id: String,
    calls: Vec<CallDescriptor>,
}

impl ServiceDescription {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            calls: Vec::new(),
        }
    }

    pub fn with_call(mut self, call: CallDescriptor) -> Self {
        self.calls.push(call);
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn calls(&self) -> &[CallDescriptor] {
        &self.calls
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Service id is empty
    EmptyServiceId,
    /// Call id is empty
    EmptyCallId { service_id: String },
    /// A call does not belong to the service it was listed in
    ForeignCall {
        service_id: String,
        call: ServiceCallId,
    },
    /// Identifier registered twice
    DuplicateCall(ServiceCallId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::EmptyServiceId => write!(f, "service id cannot be empty"),
            RegistryError::EmptyCallId { service_id } => {
                write!(f, "call id cannot be empty (service {service_id})")
            }
            RegistryError::ForeignCall { service_id, call } => {
                write!(f, "call {call} listed in service {service_id}")
            }
            RegistryError::DuplicateCall(call) => write!(f, "call {call} registered twice"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Lookup table from call identifier to descriptor.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    calls: HashMap<ServiceCallId, CallDescriptor>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every call of a service.
    ///
    /// Nothing is added when any call is rejected.
    pub fn register(&mut self, service: ServiceDescription) -> Result<(), RegistryError> {
        if service.service_id.is_empty() {
            return Err(RegistryError::EmptyServiceId);
        }
        let mut seen = Vec::with_capacity(service.calls.len());
        for call in &service.calls {
            let id = call.id();
            if id.service_id != service.service_id {
                return Err(RegistryError::ForeignCall {
                    service_id: service.service_id.clone(),
                    call: id.clone(),
                });
            }
            if id.call_id.is_empty() {
                return Err(RegistryError::EmptyCallId {
                    service_id: service.service_id.clone(),
                });
            }
            if self.calls.contains_key(id) || seen.contains(&id) {
                return Err(RegistryError::DuplicateCall(id.clone()));
            }
            seen.push(id);
        }
        for call in service.calls {
            self.calls.insert(call.id().clone(), call);
        }
        Ok(())
    }

    pub fn get_call_by_id(&self, id: &ServiceCallId) -> Option<&CallDescriptor> {
        self.calls.get(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SingleCall;

    fn ping(service: &str) -> CallDescriptor {
        let call: SingleCall<(), ()> = SingleCall::new(service, "ping");
        CallDescriptor::single(&call, |_: ()| async { Ok(()) })
    }

    #[test]
    fn registered_calls_are_found() {
        let mut registry = ServiceRegistry::new();
        registry
            .register(ServiceDescription::new("echo").with_call(ping("echo")))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(
            registry
                .get_call_by_id(&ServiceCallId::new("echo", "ping"))
                .is_some()
        );
        assert!(
            registry
                .get_call_by_id(&ServiceCallId::new("echo", "pong"))
                .is_none()
        );
    }

    #[test]
    fn duplicates_are_rejected_atomically() {
        let mut registry = ServiceRegistry::new();
        registry
            .register(ServiceDescription::new("echo").with_call(ping("echo")))
            .unwrap();
        let err = registry
            .register(ServiceDescription::new("echo").with_call(ping("echo")))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateCall(ServiceCallId::new("echo", "ping"))
        );

        let mut fresh = ServiceRegistry::new();
        let twice = ServiceDescription::new("echo")
            .with_call(ping("echo"))
            .with_call(ping("echo"));
        assert!(fresh.register(twice).is_err());
        assert!(fresh.is_empty());
    }

    #[test]
    fn calls_must_belong_to_their_service() {
        let mut registry = ServiceRegistry::new();
        let err = registry
            .register(ServiceDescription::new("echo").with_call(ping("other")))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ForeignCall { .. }));
        assert_eq!(
            registry.register(ServiceDescription::new("")),
            Err(RegistryError::EmptyServiceId)
        );
    }
}
