pub mod logging;
pub mod metrics;

pub use logging::{init_logging, mask_url_credentials, LogConfig, LogFormat};
pub use metrics::{get_metrics, init_metrics, LatencyTimer, Metrics, Outcome, METRICS};
