use std::time::{Duration, Instant};

use crate::channel::{ByteChannel, SerialChannel, SocketChannel, SubprocessChannel};
use crate::error::{ChannelError, HandshakeFailedError};

/// The 8-byte magic sequence host and device use to synchronise their
/// streams. Has no proper self-overlap, so a naive prefix-restart matcher
/// (no Knuth-Morris-Pratt) is correct — see [`await_token`].
pub const HANDSHAKE_TOKEN: [u8; 8] = [0x01, 0x23, 0x57, 0xBD, 0xBD, 0x57, 0x23, 0x01];

/// Per-medium knobs that control handshake behaviour. Whether a device
/// sends the token first (a liveness probe the host must answer) or sends
/// it spontaneously on boot is data, not protocol, so it lives here rather
/// than as a hard-coded per-transport branch.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
	pub send_token_first: bool,
	pub timeout: Duration,
}

impl Default for HandshakeConfig {
	fn default() -> Self {
		HandshakeConfig { send_token_first: false, timeout: Duration::from_secs(5) }
	}
}

/// Reads one byte at a time until `HANDSHAKE_TOKEN` has been matched in
/// full, restarting the match at the first mismatching byte. Bounded by
/// `deadline`; every observed byte (matched or not) is carried in the
/// returned error so recovery can log what actually came over the wire.
fn await_token(channel: &mut dyn ByteChannel, deadline: Instant) -> Result<(), HandshakeFailedError> {
	let mut matched = 0usize;
	let mut observed = Vec::new();
	while matched < HANDSHAKE_TOKEN.len() {
		if Instant::now() >= deadline {
			return Err(HandshakeFailedError {
				actual_received: observed,
				reason: Some("timed out awaiting handshake token".to_owned()),
			});
		}
		match channel.read_exact(1) {
			Ok(byte) => {
				observed.push(byte[0]);
				if byte[0] == HANDSHAKE_TOKEN[matched] {
					matched += 1;
				} else {
					matched = usize::from(byte[0] == HANDSHAKE_TOKEN[0]);
				}
			}
			Err(ChannelError::Timeout { received, .. }) if received.is_empty() => continue,
			Err(ChannelError::Timeout { received, .. }) => {
				observed.extend(received);
			}
			Err(e) => {
				return Err(HandshakeFailedError { actual_received: observed, reason: Some(e.to_string()) });
			}
		}
	}
	Ok(())
}

fn send_token(channel: &mut dyn ByteChannel) -> Result<(), HandshakeFailedError> {
	channel
		.write_all(&HANDSHAKE_TOKEN)
		.map_err(|e| HandshakeFailedError { actual_received: Vec::new(), reason: Some(e.to_string()) })
}

/// Target for [`Transport::reset`]: identifies the medium-specific address
/// to (re)open.
#[derive(Debug, Clone)]
pub enum ConnectInfo {
	Serial { path: String, baud_rate: u32 },
	Socket { host: String, port: u16 },
	Subprocess { command: String, args: Vec<String> },
}

pub struct SerialTransport {
	path: String,
	baud_rate: u32,
	handshake_cfg: HandshakeConfig,
	channel: Option<SerialChannel>,
}

pub struct SocketTransport {
	host: String,
	port: u16,
	handshake_cfg: HandshakeConfig,
	channel: Option<SocketChannel>,
}

pub struct SubprocessTransport {
	command: String,
	args: Vec<String>,
	handshake_cfg: HandshakeConfig,
	channel: Option<SubprocessChannel>,
}

/// A pre-established, already-open channel handed in directly rather than
/// opened by `reset()`. Used by integration tests (a `UnixStream` pair
/// standing in for a serial port) and by embedders driving an exotic
/// medium the three built-in variants don't cover.
pub struct CustomTransport {
	channel: Box<dyn ByteChannel>,
}

/// Owns one [`ByteChannel`] and performs medium-specific reset, handshake,
/// and reconnect. Modelled as a sealed set of variants (rather than a
/// trait object) since the three media are closed and known up front.
pub enum Transport {
	Serial(SerialTransport),
	Socket(SocketTransport),
	Subprocess(SubprocessTransport),
	Custom(CustomTransport),
}

impl Transport {
	pub fn serial(path: impl Into<String>, baud_rate: u32, handshake_cfg: HandshakeConfig) -> Self {
		Transport::Serial(SerialTransport { path: path.into(), baud_rate, handshake_cfg, channel: None })
	}

	pub fn socket(host: impl Into<String>, port: u16, handshake_cfg: HandshakeConfig) -> Self {
		Transport::Socket(SocketTransport { host: host.into(), port, handshake_cfg, channel: None })
	}

	pub fn subprocess(command: impl Into<String>, args: Vec<String>, handshake_cfg: HandshakeConfig) -> Self {
		Transport::Subprocess(SubprocessTransport { command: command.into(), args, handshake_cfg, channel: None })
	}

	/// Builds the right variant from a [`ConnectInfo`] target.
	pub fn new(info: ConnectInfo, handshake_cfg: HandshakeConfig) -> Self {
		match info {
			ConnectInfo::Serial { path, baud_rate } => Transport::serial(path, baud_rate, handshake_cfg),
			ConnectInfo::Socket { host, port } => Transport::socket(host, port, handshake_cfg),
			ConnectInfo::Subprocess { command, args } => Transport::subprocess(command, args, handshake_cfg),
		}
	}

	/// Wraps an already-open channel. `reset()` is a no-op for this
	/// variant (there is nothing generic to reopen) and `handshake()`
	/// assumes the token exchange, if any, already happened on `channel`.
	pub fn custom(channel: Box<dyn ByteChannel>) -> Self {
		Transport::Custom(CustomTransport { channel })
	}

	/// Discards any existing channel and opens a fresh one. Idempotent:
	/// calling twice in a row is the same as calling once.
	pub fn reset(&mut self) -> Result<(), ChannelError> {
		match self {
			Transport::Serial(t) => {
				if let Some(mut old) = t.channel.take() {
					old.close();
				}
				t.channel = Some(SerialChannel::open(&t.path, t.baud_rate, t.handshake_cfg.timeout)?);
			}
			Transport::Socket(t) => {
				if let Some(mut old) = t.channel.take() {
					old.close();
				}
				let addr = format!("{}:{}", t.host, t.port);
				t.channel = Some(SocketChannel::connect(&addr, t.handshake_cfg.timeout)?);
			}
			Transport::Subprocess(t) => {
				if let Some(mut old) = t.channel.take() {
					old.close();
				}
				t.channel = Some(SubprocessChannel::spawn(&t.command, &t.args, t.handshake_cfg.timeout)?);
			}
			Transport::Custom(_) => {}
		}
		Ok(())
	}

	/// Performs the medium-specific handshake. Must not leave a half-open
	/// channel behind on failure — the caller is expected to `reset()`
	/// again before retrying.
	pub fn handshake(&mut self) -> Result<(), HandshakeFailedError> {
		// Sockets have no token exchange: a successful `connect()` in
		// `reset()` is the entire handshake. A custom channel is assumed to
		// have already synchronised by the time it's handed in.
		if matches!(self, Transport::Socket(_) | Transport::Custom(_)) {
			return Ok(());
		}

		let cfg = self.handshake_cfg().clone();
		let deadline = Instant::now() + cfg.timeout;
		let channel = self
			.channel_mut()
			.ok_or_else(|| HandshakeFailedError { actual_received: Vec::new(), reason: Some("no channel open".to_owned()) })?;

		if cfg.send_token_first {
			send_token(channel)?;
		}
		await_token(channel, deadline)
	}

	/// Adjusts timeouts for the operational phase and hands back the
	/// channel for the session to drive directly.
	pub fn finalize(&mut self) -> Option<&mut dyn ByteChannel> {
		match self {
			Transport::Serial(t) => {
				if let Some(c) = t.channel.as_mut() {
					c.set_timeout(Duration::from_secs(3600));
				}
			}
			Transport::Subprocess(t) => {
				if let Some(c) = t.channel.as_mut() {
					c.set_timeout(Duration::from_millis(100));
				}
			}
			Transport::Socket(_) | Transport::Custom(_) => {}
		}
		self.channel_mut()
	}

	/// Serial-only: polls for the port to reappear after a hard reset,
	/// retrying on the original path as a best guess if no better match is
	/// found within `threshold`.
	pub fn await_reconnect(&mut self, threshold: Duration) -> Result<(), ChannelError> {
		let path = match self {
			Transport::Serial(t) => t.path.clone(),
			_ => return Ok(()),
		};
		let deadline = Instant::now() + threshold;
		while Instant::now() < deadline {
			if let Ok(ports) = serialport::available_ports() {
				if ports.iter().any(|p| p.port_name == path) {
					return self.reset();
				}
			}
			std::thread::sleep(Duration::from_millis(200));
		}
		self.reset()
	}

	pub fn channel_mut(&mut self) -> Option<&mut dyn ByteChannel> {
		match self {
			Transport::Serial(t) => t.channel.as_mut().map(|c| c as &mut dyn ByteChannel),
			Transport::Socket(t) => t.channel.as_mut().map(|c| c as &mut dyn ByteChannel),
			Transport::Subprocess(t) => t.channel.as_mut().map(|c| c as &mut dyn ByteChannel),
			Transport::Custom(t) => Some(t.channel.as_mut()),
		}
	}

	pub fn close(&mut self) {
		if let Some(c) = self.channel_mut() {
			c.close();
		}
	}

	fn handshake_cfg(&self) -> &HandshakeConfig {
		// Unreachable for Socket/Custom: `handshake()` returns early for
		// both before consulting this.
		static DEFAULT: HandshakeConfig = HandshakeConfig { send_token_first: false, timeout: Duration::from_secs(5) };
		match self {
			Transport::Serial(t) => &t.handshake_cfg,
			Transport::Socket(t) => &t.handshake_cfg,
			Transport::Subprocess(t) => &t.handshake_cfg,
			Transport::Custom(_) => &DEFAULT,
		}
	}

	/// Device-family hard-reset kind, used by [`crate::recovery`] to decide
	/// how to knock a wedged board back into its bootloader. `None` for
	/// media with no hard-reset concept (socket).
	pub fn is_serial(&self) -> bool {
		matches!(self, Transport::Serial(_))
	}

	pub fn is_subprocess(&self) -> bool {
		matches!(self, Transport::Subprocess(_))
	}

	/// The serial device path, for recovery steps that need to reopen the
	/// port directly (hard-reset DTR toggling). `None` for every other
	/// medium.
	pub fn serial_path(&self) -> Option<&str> {
		match self {
			Transport::Serial(t) => Some(&t.path),
			_ => None,
		}
	}
}
