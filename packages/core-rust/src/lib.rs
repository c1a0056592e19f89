//! Courier Core: message identity, route naming, delivery patterns, envelopes,
//! transport codec, idempotency keys, and failure-ladder policy.

pub mod clock;
pub mod envelope;
pub mod hash;
pub mod idempotency;
pub mod identity;
pub mod naming;
pub mod pattern;
pub mod policy;
pub mod transport;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use envelope::EventEnvelope;
pub use idempotency::{IdempotencyKey, KeySource};
pub use identity::{Message, MessageHeader, MessageType, MessageTypeIdentity, Request, RoutingError};
pub use naming::{route_name, Address, AddressingMode, RouteName};
pub use pattern::{BrokerPrimitive, ConsumerShape, DeliveryPattern, UnknownShape};
pub use policy::{FailureLadder, LadderStep, RedeliveryPolicy, RetryPolicy};
pub use transport::{CodecError, TransportHeaders, TransportMessage};

#[cfg(test)]
mod tests {
    use super::*;

    struct OrderCreated;

    impl MessageType for OrderCreated {
        const NAME: &'static str = "OrderCreated";
        const PREFIX: Option<&'static str> = Some("sales");
    }

    #[test]
    fn every_pattern_resolves_through_the_public_surface() {
        let routes: Vec<String> = DeliveryPattern::ALL
            .iter()
            .map(|&pattern| RouteName::for_type::<OrderCreated>(pattern).to_string())
            .collect();
        assert_eq!(
            routes,
            vec![
                "sales.order-created.cmd",
                "sales.order-created.rpc",
                "sales.order-created.pubq",
                "sales.order-created.evtq",
                "sales.order-created.cmd",
                "sales.order-created.evtq",
            ]
        );
    }
}
