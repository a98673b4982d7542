pub mod dummy;
pub mod file;
pub mod tcp;

pub use dummy::DummyInput;
pub use file::FileInput;
pub use tcp::{TcpInput, TlsIdentity};
