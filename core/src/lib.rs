//! Host-side framed RPC session for driving a remote C++ REPL executor
//! over serial, TCP, or a subprocess pipe.
//!
//! This crate implements the device-session core of an embedded REPL's
//! host tooling: a length-prefixed wire protocol, a transport abstraction
//! with per-medium handshake/reset/reconnect, a small endpoint registry
//! (`lookup`, `commit`, `execute`, `memory.read.cstr`), the session state
//! machine that drives request/response exchange over it, and the
//! recovery cascade that kicks in when a handshake fails. Device-specific
//! compiler flags, third-party flashing tools, and the host compiler
//! front-end are external collaborators, not part of this crate.
//!
//! The entry point most embedders want is [`device::DeviceSession`].

pub mod channel;
pub mod device;
pub mod endian;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod host;
pub mod opcode;
pub mod recovery;
pub mod session;
pub mod transport;

pub use device::{DeviceProperties, DeviceSession, SerialDeviceConfig, SocketDeviceConfig, SubprocessDeviceConfig};
pub use endian::Endian;
pub use endpoint::{CallInput, CallOutput, CommitSegment, Endpoint, EndpointRegistry};
pub use error::{SessionError, SessionResult};
pub use host::{HostCallbacks, RecoveryPrompt, ResultFormat, StdHost, StdRecoveryPrompt};
pub use opcode::Opcode;
pub use recovery::{ExternalFlasher, FirmwareImage, HardResetKind, RecoveryConfig};
pub use session::{Session, SetupInfo};
pub use transport::{ConnectInfo, HandshakeConfig, Transport, HANDSHAKE_TOKEN};
