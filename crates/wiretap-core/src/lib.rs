pub mod config;
pub mod error;
pub mod filtered_set;
pub mod hash;
pub mod limiter;
pub mod message;
pub mod modifier;
pub mod plugin;
pub mod prettify;
pub mod proto;
pub mod stats;
pub mod testutil;
pub mod time;

pub use config::{CoreConfig, SplitMode};
pub use error::{PluginError, PluginResult};
pub use message::{session_prefix, Message, PayloadType, Uuid, PAYLOAD_SEPARATOR};
pub use plugin::{Closer, Describe, Reader, ResponseSource, Writer};
pub use prettify::prettify_http;
pub use stats::Stats;
