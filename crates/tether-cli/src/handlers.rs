//! Robot-facing handler modules run by `tether run`.
//!
//! Both are thin [`ServiceConsumer`]s: every handle and subscription goes
//! through the supervisor, so a robot restart never leaves them holding a
//! dead proxy.

use serde_json::{Value, json};
use tether_kernel::ServiceConsumer;
use tether_middleware::PresenceBus;
use tether_types::{CapabilityName, HandlerId, PresenceEvent, TetherError, TransportError};
use tracing::{error, info};

pub const TOUCH_EVENT: &str = "FrontTactilTouched";
pub const ARRIVED_EVENT: &str = "PeoplePerception/JustArrived";
pub const LEFT_EVENT: &str = "PeoplePerception/JustLeft";

const SPEECH: &str = "ALTextToSpeech";
const BEHAVIORS: &str = "ALBehaviorManager";
const PEOPLE: &str = "ALPeoplePerception";

/// Detection range for people perception, in metres.
const DETECTION_RANGE: f64 = 0.5;

/// Toggles the conversation when the front head sensor is tapped.
pub struct HeadTapped {
    consumer: ServiceConsumer,
    presence: PresenceBus,
}

impl HeadTapped {
    pub fn new(consumer: ServiceConsumer, presence: PresenceBus) -> Self {
        Self { consumer, presence }
    }

    pub fn handler_id(&self) -> &HandlerId {
        self.consumer.handler_id()
    }

    pub async fn start(&self) {
        // Failed subscriptions are remembered and replayed on reconnect.
        if self.consumer.subscribe(TOUCH_EVENT, "onTactilTouched").await.is_ok() {
            info!(handler = %self.consumer.name(), "head touch handler ready");
        }
    }

    /// Handle a sensor reading.  Only a full press (`1.0`) counts; returns
    /// the resulting presence change.
    pub async fn on_touched(&self, value: f64) -> Option<PresenceEvent> {
        info!(value, "head touched");
        if value != 1.0 {
            return None;
        }

        self.call(SPEECH, "stopAll", vec![]).await;
        if self.presence.is_present() {
            info!("goodbye: head tapped while a person is engaged");
            let event = self.presence.set_present(false);
            self.call(BEHAVIORS, "startBehavior", vec![json!("ht_animation_lib/tickle_1")])
                .await;
            event
        } else {
            info!("hello: head tapped while nobody is engaged");
            self.call(SPEECH, "say", vec![json!("Ahh")]).await;
            self.call(
                BEHAVIORS,
                "runBehavior",
                vec![json!("animations/Stand/Reactions/TouchHead_3")],
            )
            .await;
            self.presence.set_present(true)
        }
    }

    async fn call(&self, capability: &str, method: &str, args: Vec<Value>) {
        if let Err(e) = call_supervised(&self.consumer, capability, method, args).await {
            error!(capability, method, error = %e, "robot call failed");
        }
    }
}

/// Logs people entering and leaving the detection range.
pub struct PersonDetector {
    consumer: ServiceConsumer,
}

impl PersonDetector {
    pub fn new(consumer: ServiceConsumer) -> Self {
        Self { consumer }
    }

    pub fn handler_id(&self) -> &HandlerId {
        self.consumer.handler_id()
    }

    pub async fn start(&self) {
        if let Err(e) = call_supervised(
            &self.consumer,
            PEOPLE,
            "setMaximumDetectionRange",
            vec![json!(DETECTION_RANGE)],
        )
        .await
        {
            error!(error = %e, "could not set detection range");
        }
        let arrived = self.consumer.subscribe(ARRIVED_EVENT, "onJustArrived").await;
        let left = self.consumer.subscribe(LEFT_EVENT, "onJustLeft").await;
        if arrived.is_ok() && left.is_ok() {
            info!(handler = %self.consumer.name(), "person detector ready");
        }
    }

    pub fn on_just_arrived(&self, value: &Value) {
        info!(%value, "person just arrived");
    }

    pub fn on_just_left(&self, value: &Value) {
        info!(%value, "person just left");
    }
}

async fn call_supervised(
    consumer: &ServiceConsumer,
    capability: &str,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, TetherError> {
    let handle = consumer.get_handle(&CapabilityName::new(capability)).await?;
    let timeout = consumer.supervisor().call_timeout();
    match tokio::time::timeout(timeout, handle.call(method, args)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TetherError::Transport(TransportError::Timeout {
            operation: format!("{capability}.{method}"),
            after_ms: timeout.as_millis() as u64,
        })),
    }
}
