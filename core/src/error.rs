use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a [`ByteChannel`](crate::channel::ByteChannel).
#[derive(Error, Debug)]
pub enum ChannelError {
	/// Fewer than the requested number of bytes arrived before the channel's
	/// configured timeout elapsed. Carries whatever was actually read, so
	/// callers (in particular the handshake token-awaiter) can report it.
	#[error("timed out waiting for {expected} byte(s); received {} byte(s)", .received.len())]
	Timeout { expected: usize, received: Vec<u8> },

	#[error("i/o error")]
	Io(#[from] io::Error),

	#[error("channel is not open")]
	NotConnected,
}

/// Errors raised while assembling or parsing a [`Frame`](crate::frame::Frame).
#[derive(Error, Debug)]
pub enum FrameError {
	#[error("value {0} does not fit in 32 bits")]
	OutOfRange(u64),

	#[error("unknown opcode: {0}")]
	UnknownOpcode(u64),

	#[error("byte string is not valid ASCII")]
	NotAscii,

	#[error("message consumed with {extra} byte(s) still unread")]
	Padding { extra: usize },

	#[error("error code must be the first byte read from the body")]
	ErrorCodeNotFirst,

	#[error("tag field must be zero unless opcode is Call (tag=0x{tag:x}, opcode={opcode})")]
	TagInvariant { tag: u64, opcode: String },

	#[error(transparent)]
	Channel(#[from] ChannelError),
}

/// Raised by [`Transport::handshake`](crate::transport::Transport::handshake)
/// when the magic token (or, for sockets, the connection itself) could not be
/// established.
#[derive(Error, Debug)]
#[error("handshake failed; actual bytes received: {}", format_bytes(.actual_received))]
pub struct HandshakeFailedError {
	pub actual_received: Vec<u8>,
	pub reason: Option<String>,
}

fn format_bytes(bytes: &[u8]) -> String {
	if bytes.is_empty() {
		return "<none>".to_owned();
	}
	bytes
		.iter()
		.map(|b| format!("{:02x}", b))
		.collect::<Vec<_>>()
		.join(" ")
}

/// External flasher invocation failed (non-zero exit code).
#[derive(Error, Debug)]
#[error("replace firmware failed with exit code {exit_code}\ncommand line: {}\noutput:\n{output}", .command_line.join(" "))]
pub struct ReplaceFirmwareError {
	pub exit_code: i32,
	pub command_line: Vec<String>,
	pub output: String,
}

/// Any other external tool invocation (not firmware replacement) failed.
#[derive(Error, Debug)]
#[error("external tool `{tool}` failed: {reason}")]
pub struct ExternalToolError {
	pub tool: PathBuf,
	pub reason: String,
}

/// Recovery exhausted every strategy for a device.
#[derive(Error, Debug)]
#[error("failed to recover connection: {0}")]
pub struct RecoveryFailedError(pub String);

/// The top-level error type returned by the public session/device API.
///
/// Variant kinds follow the taxonomy in the device-session specification: a
/// handshake failure is recoverable (it is handed to [`crate::recovery`]
/// before ever reaching a caller as `SessionError::Recovery`), everything
/// else is terminal for the call or the session.
#[derive(Error, Debug)]
pub enum SessionError {
	#[error(transparent)]
	Handshake(#[from] HandshakeFailedError),

	#[error(transparent)]
	Recovery(#[from] RecoveryFailedError),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("device reported an error: {0}")]
	DeviceError(String),

	#[error("unexpected reboot mid-session")]
	UnexpectedReboot { setup_frame: crate::frame::InboundFrame },

	#[error("unexpected disconnect: {0}")]
	UnexpectedDisconnect(String),

	#[error("invalid request: {0}")]
	HostApi(String),

	#[error(transparent)]
	ReplaceFirmwareFailed(#[from] ReplaceFirmwareError),

	#[error(transparent)]
	ExternalToolFailed(#[from] ExternalToolError),

	#[error("device recovery process cancelled by user")]
	UserInterrupt,

	#[error(transparent)]
	Frame(#[from] FrameError),

	#[error(transparent)]
	Channel(#[from] ChannelError),
}

impl From<io::Error> for SessionError {
	fn from(err: io::Error) -> Self {
		SessionError::Channel(ChannelError::Io(err))
	}
}

pub type SessionResult<T> = Result<T, SessionError>;
