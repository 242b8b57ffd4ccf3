//! Service communicator
//!
//! One `ServiceCommunicator` per service name. It holds a reference to the
//! shared bus until `shutdown` releases it; every call after that fails with
//! `BusError::ShutDown`. Payloads are typed at each call site and travel as
//! JSON on the bus.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broker::correlation::RequestOptions;
use crate::broker::engine::{MessageBus, Subscription};
use crate::broker::message::{Message, Priority, PublishOptions, merge_fields};
use crate::broker::topic::handler;
use crate::client::protocol::{
    HealthReport, HealthStatus, RegistrationAck, ServiceInfo, StatusUpdate,
};
use crate::client::topics::{self, HEALTH_CHECK, SERVICE_REGISTER, SERVICE_STATUS};
use crate::config::GatewaySettings;
use crate::utils::{BusError, HandlerError, HandlerResult};

pub const SENDER_FIELD: &str = "_sender";
pub const TIMESTAMP_FIELD: &str = "_timestamp";

#[derive(Debug)]
pub struct ServiceCommunicator {
    service: String,
    bus: RwLock<Option<Arc<MessageBus>>>,
    gateway: GatewaySettings,
}

impl ServiceCommunicator {
    pub fn new(service: &str, bus: Arc<MessageBus>, gateway: GatewaySettings) -> Arc<Self> {
        Arc::new(Self {
            service: service.to_string(),
            bus: RwLock::new(Some(bus)),
            gateway,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// The bus, unless this communicator has been shut down.
    pub fn bus(&self) -> Result<Arc<MessageBus>, BusError> {
        self.bus
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BusError::ShutDown {
                service: self.service.clone(),
            })
    }

    async fn publish_to<T: Serialize + ?Sized>(
        &self,
        target: &str,
        topic: &str,
        payload: &T,
        options: PublishOptions,
        stamp: bool,
    ) -> Result<String, BusError> {
        let bus = self.bus()?;
        let mut payload = serde_json::to_value(payload)?;
        if stamp {
            payload = merge_fields(
                payload,
                vec![
                    (SENDER_FIELD, Value::String(self.service.clone())),
                    (
                        TIMESTAMP_FIELD,
                        Value::from(chrono::Utc::now().timestamp_millis()),
                    ),
                ],
            );
        }
        let options = topics::options_for(topic, options);
        let message = Message::new(target, payload, &self.service, options);
        Ok(bus.publish_message(message).await)
    }

    /// Publish to `destination.topic`.
    pub async fn send_to_service<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        topic: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        let target = topics::scoped(destination, topic);
        self.publish_to(&target, topic, payload, options, false)
            .await
    }

    /// Publish to the bare `topic`, stamped with `_sender` and `_timestamp`.
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        self.publish_to(topic, topic, payload, options, true).await
    }

    /// Subscribe to both `service.topic` and `topic`. The returned handle
    /// removes both registrations.
    ///
    /// A payload that does not deserialize into `T` is reported as a handler
    /// error for that message.
    pub fn on_message<T, F, Fut>(&self, topic: &str, callback: F) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let bus = self.bus()?;
        let callback = Arc::new(callback);
        let typed = handler(move |payload: Value, message: Message| {
            let callback = Arc::clone(&callback);
            async move {
                let payload: T = serde_json::from_value(payload)
                    .map_err(|e| -> HandlerError { Box::new(e) })?;
                callback(payload, message).await
            }
        });

        let direct = bus.subscribe(&topics::scoped(&self.service, topic), Arc::clone(&typed));
        let bare = bus.subscribe(topic, typed);
        debug!(service = %self.service, topic, "listening");
        Ok(direct.join(bare))
    }

    /// Typed request/response against `destination`.
    pub async fn request<Req, Resp>(
        &self,
        destination: &str,
        topic: &str,
        payload: &Req,
        options: RequestOptions,
    ) -> Result<Resp, BusError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let bus = self.bus()?;
        let payload = serde_json::to_value(payload)?;
        let options = RequestOptions {
            publish: topics::options_for(topic, options.publish),
            timeout_ms: options.timeout_ms,
        };
        let response = bus
            .request(&self.service, destination, topic, payload, options)
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Answer the request whose payload was `original`.
    pub async fn respond<R: Serialize + ?Sized>(
        &self,
        original: &Value,
        response: &R,
    ) -> Result<String, BusError> {
        let bus = self.bus()?;
        let response = serde_json::to_value(response)?;
        bus.respond(&self.service, original, response).await
    }

    /// Register with the coordinator and wait for its acknowledgment.
    pub async fn register_with_gateway(
        &self,
        info: &ServiceInfo,
    ) -> Result<RegistrationAck, BusError> {
        let options = RequestOptions::with_timeout_ms(self.gateway.registration_timeout_ms)
            .publish(PublishOptions::with_priority(Priority::High));
        let ack: RegistrationAck = self
            .request(&self.gateway.service, SERVICE_REGISTER, info, options)
            .await?;
        if ack.accepted {
            info!(service = %self.service, gateway = %self.gateway.service, "registered with gateway");
        } else {
            warn!(
                service = %self.service,
                gateway = %self.gateway.service,
                reason = ack.message.as_deref().unwrap_or("unspecified"),
                "gateway refused registration"
            );
        }
        Ok(ack)
    }

    /// Ask `service` for its health. Times out after the high-priority TTL.
    pub async fn check_service_health(&self, service: &str) -> Result<HealthReport, BusError> {
        self.check_service_health_with(service, RequestOptions::default())
            .await
    }

    pub async fn check_service_health_with(
        &self,
        service: &str,
        options: RequestOptions,
    ) -> Result<HealthReport, BusError> {
        let probe = serde_json::json!({ "requestedBy": self.service });
        self.request(service, HEALTH_CHECK, &probe, options).await
    }

    /// High-priority broadcast of this service's status.
    pub async fn broadcast_service_status(
        &self,
        status: &str,
        details: Value,
    ) -> Result<String, BusError> {
        let update = StatusUpdate {
            service: self.service.clone(),
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            details,
        };
        self.broadcast(
            SERVICE_STATUS,
            &update,
            PublishOptions::with_priority(Priority::High),
        )
        .await
    }

    /// Answer `health-check` requests addressed to this service.
    pub fn serve_health_checks(self: &Arc<Self>) -> Result<Subscription, BusError> {
        let this: Weak<Self> = Arc::downgrade(self);
        self.on_message(HEALTH_CHECK, move |_probe: Value, message: Message| {
            let this = this.clone();
            async move {
                let Some(this) = this.upgrade() else {
                    return HandlerResult::Ok(());
                };
                let queued = this.bus().map(|bus| bus.queue_len()).unwrap_or(0);
                let report = HealthReport {
                    service: this.service.clone(),
                    status: HealthStatus::Healthy,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    queued,
                };
                this.respond(&message.payload, &report).await?;
                HandlerResult::Ok(())
            }
        })
    }

    /// Coordinator side of `register_with_gateway`: `decide` turns each
    /// registration into an acknowledgment.
    pub fn serve_registrations<F>(self: &Arc<Self>, decide: F) -> Result<Subscription, BusError>
    where
        F: Fn(ServiceInfo) -> RegistrationAck + Send + Sync + 'static,
    {
        let this: Weak<Self> = Arc::downgrade(self);
        let decide = Arc::new(decide);
        self.on_message(SERVICE_REGISTER, move |info: ServiceInfo, message: Message| {
            let this = this.clone();
            let decide = Arc::clone(&decide);
            async move {
                let Some(this) = this.upgrade() else {
                    return HandlerResult::Ok(());
                };
                let ack = decide(info);
                this.respond(&message.payload, &ack).await?;
                HandlerResult::Ok(())
            }
        })
    }

    /// Release the bus reference. Pending messages are not flushed.
    pub fn shutdown(&self) {
        let released = self
            .bus
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            info!(service = %self.service, "communicator shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.bus
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
