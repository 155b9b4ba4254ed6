//! The session service both peers register.

use std::sync::Arc;

use tandem_core::{CallDescriptor, Role, RpcError, ServiceDescription, SingleCall};
use tracing::debug;

use crate::context::SessionContext;
use crate::update::{ContextUpdateRequest, ContextUpdateResult};

pub const SESSION_SERVICE: &str = "tandem.session";

pub fn update_call() -> SingleCall<ContextUpdateRequest, ContextUpdateResult> {
    SingleCall::new(SESSION_SERVICE, "update")
}

pub fn clear_call() -> SingleCall<(), ()> {
    SingleCall::new(SESSION_SERVICE, "clear")
}

/// The server validates updates against its replica; the client takes
/// whatever the server committed.
pub(crate) fn session_service(context: Arc<SessionContext>, role: Role) -> ServiceDescription {
    let update_context = context.clone();
    let update = CallDescriptor::single(&update_call(), move |request: ContextUpdateRequest| {
        let context = update_context.clone();
        async move {
            let result = match role {
                Role::Server => context.try_commit(&request),
                Role::Client => {
                    context.apply(&request);
                    ContextUpdateResult::Accepted
                }
            };
            debug!(
                updates = request.updates.len(),
                accepted = result.is_accepted(),
                "peer context update"
            );
            Ok::<_, RpcError>(result)
        }
    });
    let clear = CallDescriptor::single(&clear_call(), move |()| {
        let context = context.clone();
        async move {
            debug!("peer cleared the context");
            context.clear();
            Ok::<_, RpcError>(())
        }
    });
    ServiceDescription::new(SESSION_SERVICE)
        .with_call(update)
        .with_call(clear)
}
