//! Capability gate and negotiation helpers
//!
//! Capabilities are opt-in feature bits exchanged during initialization.
//! Every method entry point consults this module before any frame is sent:
//! a peer may not call a method whose required capability the counterparty
//! did not declare, and under strict mode a peer may not register a handler
//! for a method whose capability it did not itself declare. Violations are
//! local errors; they never reach the wire.

use crate::protocol::{
    methods, ClientCapabilities, ElicitationCapability, FormElicitationCapability,
    ServerCapabilities,
};
use crate::{Error, Result};

/// Normalize a client capability object received on the wire.
///
/// An empty `elicitation: {}` historically meant "form mode supported", so
/// it becomes `elicitation: {form: {}}`. An explicit `form` or `url` member
/// suppresses the injection. The normalized object is authoritative from
/// here on.
pub fn normalize_client_capabilities(mut capabilities: ClientCapabilities) -> ClientCapabilities {
    if let Some(elicitation) = &mut capabilities.elicitation {
        if elicitation.form.is_none() && elicitation.url.is_none() {
            elicitation.form = Some(FormElicitationCapability::default());
        }
    }
    capabilities
}

/// Whether the elicitation capability declares form mode
pub fn supports_form_elicitation(elicitation: Option<&ElicitationCapability>) -> bool {
    elicitation.is_some_and(|e| e.form.is_some())
}

/// Whether the elicitation capability declares url mode
pub fn supports_url_elicitation(elicitation: Option<&ElicitationCapability>) -> bool {
    elicitation.is_some_and(|e| e.url.is_some())
}

/// Whether the elicitation capability asks for client-side default injection
pub fn applies_form_defaults(elicitation: Option<&ElicitationCapability>) -> bool {
    elicitation
        .and_then(|e| e.form.as_ref())
        .and_then(|f| f.apply_defaults)
        .unwrap_or(false)
}

fn server_capability_error(what: &str, method: &str) -> Error {
    Error::Capability(format!(
        "Server does not support {} (required for {})",
        what, method
    ))
}

fn client_capability_error(what: &str, method: &str) -> Error {
    Error::Capability(format!(
        "Client does not support {} (required for {})",
        what, method
    ))
}

/// Assert that the server declared the capability required by a
/// client-originated request.
pub fn assert_server_capability(capabilities: &ServerCapabilities, method: &str) -> Result<()> {
    match method {
        methods::SET_LOGGING_LEVEL => {
            if capabilities.logging.is_none() {
                return Err(server_capability_error("logging", method));
            }
        }
        methods::GET_PROMPT | methods::LIST_PROMPTS => {
            if capabilities.prompts.is_none() {
                return Err(server_capability_error("prompts", method));
            }
        }
        methods::LIST_RESOURCES
        | methods::LIST_RESOURCE_TEMPLATES
        | methods::READ_RESOURCE => {
            if capabilities.resources.is_none() {
                return Err(server_capability_error("resources", method));
            }
        }
        methods::SUBSCRIBE_RESOURCE | methods::UNSUBSCRIBE_RESOURCE => {
            let resources = capabilities
                .resources
                .as_ref()
                .ok_or_else(|| server_capability_error("resources", method))?;
            if !resources.subscribe.unwrap_or(false) {
                return Err(server_capability_error("resource subscriptions", method));
            }
        }
        methods::CALL_TOOL | methods::LIST_TOOLS => {
            if capabilities.tools.is_none() {
                return Err(server_capability_error("tools", method));
            }
        }
        methods::COMPLETE => {
            if capabilities.completions.is_none() {
                return Err(server_capability_error("completions", method));
            }
        }
        // ping and initialize are always available
        _ => {}
    }
    Ok(())
}

/// Assert that the client declared the capability required by a
/// server-originated request.
pub fn assert_client_capability(capabilities: &ClientCapabilities, method: &str) -> Result<()> {
    match method {
        methods::CREATE_MESSAGE => {
            if capabilities.sampling.is_none() {
                return Err(client_capability_error("sampling", method));
            }
        }
        methods::LIST_ROOTS => {
            if capabilities.roots.is_none() {
                return Err(client_capability_error("roots", method));
            }
        }
        methods::ELICITATION_CREATE => {
            if capabilities.elicitation.is_none() {
                return Err(client_capability_error("elicitation", method));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Assert that the client itself declared the capability required by a
/// notification it is about to send.
pub fn assert_client_notification_capability(
    capabilities: &ClientCapabilities,
    method: &str,
) -> Result<()> {
    if method == methods::NOTIFICATION_ROOTS_LIST_CHANGED {
        let declared = capabilities
            .roots
            .as_ref()
            .and_then(|r| r.list_changed)
            .unwrap_or(false);
        if !declared {
            return Err(client_capability_error(
                "roots list-changed notifications",
                method,
            ));
        }
    }
    Ok(())
}

/// Assert that the server itself declared the capability required by a
/// notification it is about to send.
pub fn assert_server_notification_capability(
    capabilities: &ServerCapabilities,
    method: &str,
) -> Result<()> {
    match method {
        methods::NOTIFICATION_MESSAGE => {
            if capabilities.logging.is_none() {
                return Err(server_capability_error("logging", method));
            }
        }
        methods::NOTIFICATION_RESOURCE_UPDATED
        | methods::NOTIFICATION_RESOURCE_LIST_CHANGED => {
            if capabilities.resources.is_none() {
                return Err(server_capability_error("resources", method));
            }
        }
        methods::NOTIFICATION_TOOL_LIST_CHANGED => {
            if capabilities.tools.is_none() {
                return Err(server_capability_error("tools", method));
            }
        }
        methods::NOTIFICATION_PROMPT_LIST_CHANGED => {
            if capabilities.prompts.is_none() {
                return Err(server_capability_error("prompts", method));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Assert that a server may register a handler for `method` under strict
/// capability enforcement: the capability must be self-declared.
pub fn assert_server_request_handler_capability(
    capabilities: &ServerCapabilities,
    method: &str,
) -> Result<()> {
    match method {
        methods::SET_LOGGING_LEVEL if capabilities.logging.is_none() => {
            Err(Error::Capability("Server does not support logging".into()))
        }
        methods::GET_PROMPT | methods::LIST_PROMPTS if capabilities.prompts.is_none() => {
            Err(Error::Capability("Server does not support prompts".into()))
        }
        methods::LIST_RESOURCES
        | methods::LIST_RESOURCE_TEMPLATES
        | methods::READ_RESOURCE
        | methods::SUBSCRIBE_RESOURCE
        | methods::UNSUBSCRIBE_RESOURCE
            if capabilities.resources.is_none() =>
        {
            Err(Error::Capability(
                "Server does not support resources".into(),
            ))
        }
        methods::CALL_TOOL | methods::LIST_TOOLS if capabilities.tools.is_none() => {
            Err(Error::Capability("Server does not support tools".into()))
        }
        methods::COMPLETE if capabilities.completions.is_none() => Err(Error::Capability(
            "Server does not support completions".into(),
        )),
        _ => Ok(()),
    }
}

/// Assert that a client may register a handler for `method` under strict
/// capability enforcement.
pub fn assert_client_request_handler_capability(
    capabilities: &ClientCapabilities,
    method: &str,
) -> Result<()> {
    match method {
        methods::CREATE_MESSAGE if capabilities.sampling.is_none() => {
            Err(Error::Capability("Client does not support sampling".into()))
        }
        methods::LIST_ROOTS if capabilities.roots.is_none() => {
            Err(Error::Capability("Client does not support roots".into()))
        }
        methods::ELICITATION_CREATE if capabilities.elicitation.is_none() => Err(
            Error::Capability("Client does not support elicitation".into()),
        ),
        _ => Ok(()),
    }
}
