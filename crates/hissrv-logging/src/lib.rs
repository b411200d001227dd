pub mod sampler;
pub mod subscriber;

pub use sampler::{LogSampler, SamplingStrategy};
pub use subscriber::{init_logging, LoggingError};
