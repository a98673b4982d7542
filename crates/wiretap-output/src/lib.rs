//! Output plugins (spec.md §4.9–§4.12): everything a captured or replayed
//! [`wiretap_core::Message`] can be written to.

pub mod binary;
pub mod dummy;
pub mod file;
pub mod http;
pub mod null;
pub mod tcp;
pub mod tls;
pub mod websocket;

pub use binary::{BinaryOutput, BinaryOutputConfig};
pub use dummy::DummyOutput;
pub use file::{FileOutput, FileOutputConfig};
pub use http::{HttpOutput, HttpOutputConfig};
pub use null::NullOutput;
pub use tcp::{TcpOutput, TcpOutputConfig};
pub use websocket::{WebSocketOutput, WebSocketOutputConfig};
