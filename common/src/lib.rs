pub mod actuator;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod page;
pub mod sampler;
pub mod store;
pub mod types;

pub use actuator::{Actuator, OutputPin};
pub use clock::monotonic_ms;
pub use config::{NetworkConfig, NodeConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState};
pub use deferred::{DeferredQueue, DeferredResponseJob, ResponseSink, WorkQueue};
pub use dispatch::{Dispatcher, SharedActuator, SharedMonitor};
pub use error::{ActuatorError, DeliveryError, SensorError, SubmitError};
pub use http::{Method, Response, Route};
pub use sampler::{Sampler, SamplerStats, Sensor, SensorSample};
pub use store::TelemetryStore;
pub use types::{DataPayload, LedCommand, LinkAddress, NodeStatus, QueueCounters, Reading};
