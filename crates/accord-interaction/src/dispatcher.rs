//! Serving side of command invocations.
//!
//! Turns an inbound invoke request into a call against the
//! [`CapabilityRegistry`] and the outcome into exactly one reply message.
//! Nothing raised here ever reaches the transport: every failure becomes an
//! `InvocationFailure` reply, and reply send errors are logged.

use crate::protocol::ProtocolLayer;
use crate::registry::{
    CapabilityId, CapabilityRegistry, InvocationContext, InvocationFault, ParameterOrigin,
    ParameterSpec,
};
use accord_core::{EndpointId, InteractionMessage, MessageId, WireParameter};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why an invocation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown capability {0}")]
    UnknownCapability(CapabilityId),
    #[error("missing parameter {name:?} for {id}")]
    MissingParameter { id: CapabilityId, name: String },
    #[error("{id} faulted: {fault}")]
    InvocationFault { id: CapabilityId, fault: InvocationFault },
}

/// Executes inbound invocations against local implementations.
pub struct InvocationDispatcher {
    registry: Arc<CapabilityRegistry>,
    protocol: Arc<dyn ProtocolLayer>,
}

impl InvocationDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, protocol: Arc<dyn ProtocolLayer>) -> Self {
        Self { registry, protocol }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Run the invocation and send the reply to `requesting`.
    ///
    /// Returns the reply that was (or would have been) sent.
    pub async fn invoke(
        &self,
        requesting: &EndpointId,
        request_id: MessageId,
        id: CapabilityId,
        supplied: Vec<WireParameter>,
    ) -> InteractionMessage {
        let reply = match self.execute(requesting, request_id, &id, supplied).await {
            Ok(Some(value)) => InteractionMessage::InvocationResult {
                in_response_to: request_id,
                value,
            },
            Ok(None) => InteractionMessage::InvocationSuccess {
                in_response_to: request_id,
            },
            Err(err) => {
                debug!(endpoint = %requesting, %request_id, "invocation failed: {err}");
                InteractionMessage::InvocationFailure {
                    in_response_to: request_id,
                    reason: err.to_string(),
                }
            }
        };

        let envelope = self.protocol.envelope(reply.clone());
        if let Err(err) = self.protocol.send_message_to(requesting, envelope).await {
            warn!(endpoint = %requesting, %request_id, "failed to send invocation reply: {err}");
        }
        reply
    }

    /// Resolve, bind and run without replying.
    ///
    /// `Ok(None)` means the member completed without a value.
    pub async fn execute(
        &self,
        requesting: &EndpointId,
        request_id: MessageId,
        id: &CapabilityId,
        supplied: Vec<WireParameter>,
    ) -> Result<Option<Value>, DispatchError> {
        let definition = self
            .registry
            .resolve(id)
            .ok_or_else(|| DispatchError::UnknownCapability(id.clone()))?;

        let args = resolve_arguments(id, &definition.parameters, requesting, request_id, supplied)?;

        let ctx = InvocationContext {
            endpoint: requesting.clone(),
            request_id,
        };
        let call = (definition.target)(ctx, args);

        // A panicking handler must not take the caller down with it.
        let outcome = match tokio::spawn(call).await {
            Ok(outcome) => outcome,
            Err(join) if join.is_cancelled() => Err(InvocationFault::Cancelled),
            Err(_) => Err(InvocationFault::failed("handler panicked")),
        };
        let value = outcome.map_err(|fault| DispatchError::InvocationFault {
            id: id.clone(),
            fault,
        })?;

        Ok(if definition.returns_value {
            Some(value.unwrap_or(Value::Null))
        } else {
            None
        })
    }
}

/// Build the ordered argument list for the parameters of `id`.
///
/// Fails on the first caller-supplied parameter that is missing.
pub fn resolve_arguments(
    id: &CapabilityId,
    parameters: &[ParameterSpec],
    requesting: &EndpointId,
    request_id: MessageId,
    supplied: Vec<WireParameter>,
) -> Result<Vec<Value>, DispatchError> {
    let mut supplied: Vec<Option<WireParameter>> = supplied.into_iter().map(Some).collect();

    parameters
        .iter()
        .map(|param| match param.origin {
            ParameterOrigin::FromCaller => supplied
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|p| p.name == param.name))
                .and_then(Option::take)
                .map(|p| p.value)
                .ok_or_else(|| DispatchError::MissingParameter {
                    id: id.clone(),
                    name: param.name.clone(),
                }),
            ParameterOrigin::InvokingEndpointId => Ok(Value::String(requesting.to_string())),
            ParameterOrigin::InvokingRequestId => Ok(Value::String(request_id.to_string())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransportError;
    use crate::registry::CapabilityDefinition;
    use accord_core::{CapabilityDescriptor, Envelope};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        local: EndpointId,
        sent: Mutex<Vec<(EndpointId, Envelope)>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                local: EndpointId::local("server"),
                sent: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl ProtocolLayer for Recorder {
        fn local_endpoint(&self) -> &EndpointId {
            &self.local
        }

        async fn send_message_to(
            &self,
            endpoint: &EndpointId,
            envelope: Envelope,
        ) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::EndpointUnreachable(endpoint.clone()));
            }
            self.sent.lock().push((endpoint.clone(), envelope));
            Ok(())
        }

        async fn send_message_and_await(
            &self,
            endpoint: &EndpointId,
            _envelope: Envelope,
        ) -> Result<Envelope, TransportError> {
            Err(TransportError::EndpointUnreachable(endpoint.clone()))
        }
    }

    fn meter() -> CapabilityDescriptor {
        CapabilityDescriptor::new("billing::Meter", "billing-contracts")
    }

    fn charge_id() -> CapabilityId {
        CapabilityId::new(meter(), "charge")
    }

    fn registry() -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                CapabilityDefinition::new(meter(), "charge", |_ctx, args| async move {
                    Ok(Some(Value::Array(args)))
                })
                .param("amount")
                .param_from("caller", ParameterOrigin::InvokingEndpointId)
                .returning(),
            )
            .unwrap();
        registry
            .register(CapabilityDefinition::new(meter(), "reset", |_ctx, _args| async { Ok(None) }))
            .unwrap();
        registry
            .register(CapabilityDefinition::new(meter(), "explode", |_ctx, _args| async {
                Err(InvocationFault::failed("meter offline"))
            }))
            .unwrap();
        registry
            .register(CapabilityDefinition::new(
                meter(),
                "panic",
                |_ctx, args: Vec<Value>| async move {
                    if args.is_empty() {
                        panic!("handler bug");
                    }
                    Ok(None)
                },
            ))
            .unwrap();
        registry
            .register(
                CapabilityDefinition::new(meter(), "whoami", |ctx, _args| async move {
                    Ok(Some(json!(ctx.request_id.to_string())))
                })
                .param_from("request", ParameterOrigin::InvokingRequestId)
                .returning(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn param(name: &str, origin: ParameterOrigin) -> ParameterSpec {
        ParameterSpec {
            name: name.into(),
            origin,
        }
    }

    #[test]
    fn arguments_follow_declared_order() {
        let params = vec![
            param("amount", ParameterOrigin::FromCaller),
            param("caller", ParameterOrigin::InvokingEndpointId),
        ];
        let e7 = EndpointId::local("E7");
        let supplied = vec![WireParameter::new("amount", 42)];
        let args =
            resolve_arguments(&charge_id(), &params, &e7, MessageId::new(), supplied).unwrap();
        assert_eq!(args, vec![json!(42), json!("local:E7")]);
    }

    #[test]
    fn missing_caller_parameter_is_named() {
        let params = vec![param("amount", ParameterOrigin::FromCaller)];
        let e7 = EndpointId::local("E7");
        let err =
            resolve_arguments(&charge_id(), &params, &e7, MessageId::new(), vec![]).unwrap_err();
        assert_eq!(
            err,
            DispatchError::MissingParameter {
                id: charge_id(),
                name: "amount".into(),
            }
        );
    }

    #[test]
    fn request_id_origin_is_substituted() {
        let params = vec![param("req", ParameterOrigin::InvokingRequestId)];
        let id = MessageId::new();
        let x = EndpointId::local("x");
        let args = resolve_arguments(&charge_id(), &params, &x, id, vec![]).unwrap();
        assert_eq!(args, vec![json!(id.to_string())]);
    }

    #[tokio::test]
    async fn value_result_is_replied() {
        let protocol = Recorder::new(false);
        let dispatcher = InvocationDispatcher::new(registry(), protocol.clone());
        let e7 = EndpointId::local("E7");
        let request = MessageId::new();

        let reply = dispatcher
            .invoke(&e7, request, charge_id(), vec![WireParameter::new("amount", 42)])
            .await;

        assert_eq!(
            reply,
            InteractionMessage::InvocationResult {
                in_response_to: request,
                value: json!([42, "local:E7"]),
            }
        );
        let sent = protocol.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, e7);
        assert_eq!(sent[0].1.sender, EndpointId::local("server"));
    }

    #[tokio::test]
    async fn missing_parameter_replies_failure() {
        let protocol = Recorder::new(false);
        let dispatcher = InvocationDispatcher::new(registry(), protocol.clone());
        let request = MessageId::new();

        let reply = dispatcher
            .invoke(&EndpointId::local("E7"), request, charge_id(), vec![])
            .await;

        assert!(matches!(
            reply,
            InteractionMessage::InvocationFailure { in_response_to, ref reason }
                if in_response_to == request && reason.contains("amount")
        ));
    }

    #[tokio::test]
    async fn unknown_capability_replies_failure() {
        let dispatcher = InvocationDispatcher::new(registry(), Recorder::new(false));
        let request = MessageId::new();
        let err = dispatcher
            .execute(
                &EndpointId::local("a"),
                request,
                &CapabilityId::new(meter(), "nope"),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCapability(_)));
    }

    #[tokio::test]
    async fn void_member_replies_success() {
        let dispatcher = InvocationDispatcher::new(registry(), Recorder::new(false));
        let request = MessageId::new();
        let reply = dispatcher
            .invoke(&EndpointId::local("a"), request, CapabilityId::new(meter(), "reset"), vec![])
            .await;
        assert_eq!(reply, InteractionMessage::InvocationSuccess { in_response_to: request });
    }

    #[tokio::test]
    async fn fault_and_panic_reply_failure() {
        let dispatcher = InvocationDispatcher::new(registry(), Recorder::new(false));
        for member in ["explode", "panic"] {
            let request = MessageId::new();
            let reply = dispatcher
                .invoke(
                    &EndpointId::local("a"),
                    request,
                    CapabilityId::new(meter(), member),
                    vec![],
                )
                .await;
            assert!(
                matches!(
                    reply,
                    InteractionMessage::InvocationFailure { in_response_to, .. }
                        if in_response_to == request
                ),
                "{member}: {reply:?}"
            );
        }
    }

    #[tokio::test]
    async fn handler_sees_request_context() {
        let dispatcher = InvocationDispatcher::new(registry(), Recorder::new(false));
        let request = MessageId::new();
        let value = dispatcher
            .execute(
                &EndpointId::local("a"),
                request,
                &CapabilityId::new(meter(), "whoami"),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(value, Some(json!(request.to_string())));
    }

    #[tokio::test]
    async fn reply_send_failure_is_swallowed() {
        let dispatcher = InvocationDispatcher::new(registry(), Recorder::new(true));
        let request = MessageId::new();
        let reply = dispatcher
            .invoke(
                &EndpointId::local("gone"),
                request,
                CapabilityId::new(meter(), "reset"),
                vec![],
            )
            .await;
        assert_eq!(reply, InteractionMessage::InvocationSuccess { in_response_to: request });
    }
}
