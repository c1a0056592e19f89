//! Delivery pattern taxonomy and the pattern -> broker primitive contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DeliveryPattern
// ---------------------------------------------------------------------------

/// The six delivery semantics a producer can choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPattern {
    FireAndForget,
    RequestResponse,
    PublishToQueue,
    BroadcastPublish,
    ScheduledSend,
    ScheduledBroadcast,
}

impl DeliveryPattern {
    /// Every pattern, in declaration order.
    pub const ALL: [DeliveryPattern; 6] = [
        DeliveryPattern::FireAndForget,
        DeliveryPattern::RequestResponse,
        DeliveryPattern::PublishToQueue,
        DeliveryPattern::BroadcastPublish,
        DeliveryPattern::ScheduledSend,
        DeliveryPattern::ScheduledBroadcast,
    ];

    /// Route-name suffix token for this pattern.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::FireAndForget | Self::ScheduledSend => "cmd",
            Self::RequestResponse => "rpc",
            Self::PublishToQueue => "pubq",
            Self::BroadcastPublish | Self::ScheduledBroadcast => "evtq",
        }
    }

    /// The broker primitive this pattern must use.
    #[must_use]
    pub const fn primitive(self) -> BrokerPrimitive {
        match self {
            Self::FireAndForget | Self::PublishToQueue => BrokerPrimitive::Send,
            Self::RequestResponse => BrokerPrimitive::Request,
            Self::BroadcastPublish => BrokerPrimitive::Publish,
            Self::ScheduledSend => BrokerPrimitive::ScheduleSend,
            Self::ScheduledBroadcast => BrokerPrimitive::SchedulePublish,
        }
    }

    /// Whether the producer waits for a correlated response.
    #[must_use]
    pub const fn expects_response(self) -> bool {
        matches!(self, Self::RequestResponse)
    }

    /// Whether the payload travels inside an `EventEnvelope`.
    #[must_use]
    pub const fn wraps_payload(self) -> bool {
        matches!(self, Self::BroadcastPublish | Self::ScheduledBroadcast)
    }

    /// Whether delivery happens at a future instant.
    #[must_use]
    pub const fn is_scheduled(self) -> bool {
        matches!(self, Self::ScheduledSend | Self::ScheduledBroadcast)
    }

    /// Stable snake-case label, used for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FireAndForget => "fire_and_forget",
            Self::RequestResponse => "request_response",
            Self::PublishToQueue => "publish_to_queue",
            Self::BroadcastPublish => "broadcast_publish",
            Self::ScheduledSend => "scheduled_send",
            Self::ScheduledBroadcast => "scheduled_broadcast",
        }
    }
}

impl fmt::Display for DeliveryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BrokerPrimitive
// ---------------------------------------------------------------------------

/// The transport operations the external broker provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerPrimitive {
    /// Send to a single address.
    Send,
    /// Send and await a correlated response.
    Request,
    /// Fan out to every subscriber.
    Publish,
    /// Send to an address at a future instant.
    ScheduleSend,
    /// Publish at a future instant.
    SchedulePublish,
}

// ---------------------------------------------------------------------------
// ConsumerShape
// ---------------------------------------------------------------------------

/// The three ways a consumer can receive a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerShape {
    /// One-way message, no response.
    Command,
    /// Request answered with a response.
    Request,
    /// Broadcast event, delivered inside an envelope.
    Event,
}

impl ConsumerShape {
    /// Patterns whose routes a consumer of this shape binds to.
    ///
    /// The scheduled patterns share the `cmd` and `evtq` routes, so binding to
    /// the immediate pattern covers them too.
    #[must_use]
    pub const fn bound_patterns(self) -> &'static [DeliveryPattern] {
        match self {
            Self::Command => &[DeliveryPattern::FireAndForget, DeliveryPattern::PublishToQueue],
            Self::Request => &[DeliveryPattern::RequestResponse],
            Self::Event => &[DeliveryPattern::BroadcastPublish],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Request => "request",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for ConsumerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a declared consumer shape is not one of the three known shapes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized consumer shape: {0:?}")]
pub struct UnknownShape(pub String);

impl FromStr for ConsumerShape {
    type Err = UnknownShape;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "command" | "cmd" => Ok(Self::Command),
            "request" | "rpc" => Ok(Self::Request),
            "event" | "evt" => Ok(Self::Event),
            _ => Err(UnknownShape(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_table_matches_contract() {
        assert_eq!(DeliveryPattern::FireAndForget.suffix(), "cmd");
        assert_eq!(DeliveryPattern::ScheduledSend.suffix(), "cmd");
        assert_eq!(DeliveryPattern::RequestResponse.suffix(), "rpc");
        assert_eq!(DeliveryPattern::PublishToQueue.suffix(), "pubq");
        assert_eq!(DeliveryPattern::BroadcastPublish.suffix(), "evtq");
        assert_eq!(DeliveryPattern::ScheduledBroadcast.suffix(), "evtq");
    }

    #[test]
    fn primitive_table_matches_contract() {
        use BrokerPrimitive as P;
        let expected = [
            (DeliveryPattern::FireAndForget, P::Send, false, false),
            (DeliveryPattern::RequestResponse, P::Request, true, false),
            (DeliveryPattern::PublishToQueue, P::Send, false, false),
            (DeliveryPattern::BroadcastPublish, P::Publish, false, true),
            (DeliveryPattern::ScheduledSend, P::ScheduleSend, false, false),
            (DeliveryPattern::ScheduledBroadcast, P::SchedulePublish, false, true),
        ];
        for (pattern, primitive, response, wrapped) in expected {
            assert_eq!(pattern.primitive(), primitive, "{pattern}");
            assert_eq!(pattern.expects_response(), response, "{pattern}");
            assert_eq!(pattern.wraps_payload(), wrapped, "{pattern}");
        }
    }

    #[test]
    fn only_scheduled_patterns_are_scheduled() {
        let scheduled: Vec<_> = DeliveryPattern::ALL
            .into_iter()
            .filter(|p| p.is_scheduled())
            .collect();
        assert_eq!(
            scheduled,
            vec![DeliveryPattern::ScheduledSend, DeliveryPattern::ScheduledBroadcast]
        );
    }

    #[test]
    fn consumer_shapes_bind_expected_patterns() {
        assert_eq!(
            ConsumerShape::Command.bound_patterns(),
            &[DeliveryPattern::FireAndForget, DeliveryPattern::PublishToQueue]
        );
        assert_eq!(
            ConsumerShape::Request.bound_patterns(),
            &[DeliveryPattern::RequestResponse]
        );
        assert_eq!(
            ConsumerShape::Event.bound_patterns(),
            &[DeliveryPattern::BroadcastPublish]
        );
    }

    #[test]
    fn shape_parses_from_declaration_names() {
        assert_eq!("Command".parse::<ConsumerShape>(), Ok(ConsumerShape::Command));
        assert_eq!(" rpc ".parse::<ConsumerShape>(), Ok(ConsumerShape::Request));
        assert_eq!("event".parse::<ConsumerShape>(), Ok(ConsumerShape::Event));
        assert_eq!(
            "saga".parse::<ConsumerShape>(),
            Err(UnknownShape("saga".to_string()))
        );
    }

    #[test]
    fn pattern_serde_is_snake_case() {
        let json = serde_json::to_string(&DeliveryPattern::ScheduledBroadcast).unwrap();
        assert_eq!(json, "\"scheduled_broadcast\"");
    }
}
