//! Protocol upgrades.
//!
//! Factories register under the protocol token they speak (for example
//! `websocket`). When a request arrives with an `Upgrade` header, the
//! first registered token from the header's comma-separated list wins:
//! its factory builds the replacement [`ConnectionProcessor`], the
//! response goes out as `101 Switching Protocols`, and the handler's
//! processor is swapped without closing the socket.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use tracing::{debug, trace};

use crate::status::StatusCode;

use super::handler::SocketHandler;
use super::processor::ConnectionProcessor;
use super::request::ServerRequest;
use super::response::{render_simple, ServerResponse};

/// Builds the replacement processor for one upgrade protocol.
pub trait ConnectionUpgradeFactory: Send + Sync {
    /// The protocol token this factory serves, e.g. `websocket`.
    /// Matching is case-insensitive.
    fn name(&self) -> &str;

    /// Negotiates the upgrade. Returning `None` for the processor
    /// refuses the upgrade (the client sees `400`). The optional bytes
    /// are appended to the `101` response body.
    fn upgrade(
        &self,
        handler: &Arc<SocketHandler>,
        request: &mut ServerRequest,
        response: &mut ServerResponse,
    ) -> (Option<Box<dyn ConnectionProcessor>>, Option<Vec<u8>>);
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<dyn ConnectionUpgradeFactory>>> =
        RwLock::new(HashMap::new());
}

/// Registers a factory process-wide under its protocol token. A later
/// registration for the same token replaces the earlier one.
pub fn register(factory: Arc<dyn ConnectionUpgradeFactory>) {
    let token = factory.name().to_ascii_lowercase();
    REGISTRY.write().unwrap().insert(token, factory);
}

/// Drops every registered factory. Intended for tests.
pub fn clear() {
    REGISTRY.write().unwrap().clear();
}

fn factory_for(token: &str) -> Option<Arc<dyn ConnectionUpgradeFactory>> {
    REGISTRY
        .read()
        .unwrap()
        .get(&token.trim().to_ascii_lowercase())
        .cloned()
}

/// Negotiates the upgrade carried by `request` and, on success, swaps
/// the handler's processor. Failure answers (`400`/`404`) are written
/// directly so this stays callable from inside the current processor's
/// `process`.
pub(crate) fn upgrade_connection(
    handler: &Arc<SocketHandler>,
    mut request: ServerRequest,
    mut response: ServerResponse,
) {
    let protocols = match request.headers().get_first("Upgrade") {
        Some(protocols) => protocols.to_owned(),
        None => {
            fail(handler, StatusCode::BadRequest, "No Upgrade header");
            return;
        }
    };

    let factory = protocols.split(',').find_map(factory_for);
    let factory = match factory {
        Some(factory) => factory,
        None => {
            debug!("no registered upgrader among {:?}", protocols);
            fail(
                handler,
                StatusCode::NotFound,
                &format!(
                    "None of the protocols specified in the Upgrade header are registered ({})",
                    protocols
                ),
            );
            return;
        }
    };

    let (new_processor, body) = factory.upgrade(handler, &mut request, &mut response);
    let new_processor = match new_processor {
        Some(p) => p,
        None => {
            fail(
                handler,
                StatusCode::BadRequest,
                "The upgrade was refused by the protocol handler",
            );
            return;
        }
    };

    trace!("upgrading {} to {}", handler.remote_address(), factory.name());
    response.set_status(StatusCode::SwitchingProtocols);
    response.set_header("Upgrade", factory.name());
    response.set_header("Connection", "Upgrade");
    response.set_upgrading();
    if let Some(body) = body {
        let _ = response.write(&body);
    }
    handler.schedule_processor_swap(new_processor);
    if let Err(e) = response.end() {
        debug!("failed to flush upgrade response: {}", e);
    }
}

fn fail(handler: &Arc<SocketHandler>, status: StatusCode, message: &str) {
    handler.write(&render_simple(status, message));
    handler.prepare_to_close();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl ConnectionUpgradeFactory for Dummy {
        fn name(&self) -> &str {
            "Echo-Proto"
        }
        fn upgrade(
            &self,
            _handler: &Arc<SocketHandler>,
            _request: &mut ServerRequest,
            _response: &mut ServerResponse,
        ) -> (Option<Box<dyn ConnectionProcessor>>, Option<Vec<u8>>) {
            (None, None)
        }
    }

    #[test]
    fn registry_is_case_insensitive() {
        clear();
        register(Arc::new(Dummy));
        assert!(factory_for("echo-proto").is_some());
        assert!(factory_for("ECHO-PROTO").is_some());
        assert!(factory_for(" Echo-Proto ").is_some());
        assert!(factory_for("other").is_none());
        clear();
        assert!(factory_for("echo-proto").is_none());
    }
}
