//! Device access: session, retry, circuit breaker

pub mod breaker;
pub mod connection;
pub mod resilient;
pub mod retry;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection::{ConnectionState, DeviceConnection};
pub use resilient::ResilientClient;
pub use retry::RetryPolicy;
