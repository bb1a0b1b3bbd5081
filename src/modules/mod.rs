//! Cross-cutting services module
//!
//! Lifecycle events, observer adapters, and metrics shared by the preflight
//! and the transport.

pub mod events;
pub mod metrics;

pub use events::{
    ClosedEvent, DEFAULT_QUEUE_CAPACITY, ErrorEvent, EventDispatcher, EventHandler, EventQueue,
    EventSender, LinkEvent, LinkObserver, LoggingHandler, MessageEvent, MetricsHandler,
    ObserverHandler, OpenedEvent, OverflowPolicy, PreflightEvent, RetryEvent, event_queue,
};
pub use metrics::{LinkMetrics, LinkStats};
