use std::time::Duration;

use crate::endian::Endian;
use crate::endpoint::{CallInput, CallOutput};
use crate::error::SessionError;
use crate::host::{HostCallbacks, RecoveryPrompt};
use crate::recovery::{ExternalFlasher, FirmwareImage, HardResetKind, RecoveryConfig};
use crate::session::Session;
use crate::transport::{ConnectInfo, HandshakeConfig, Transport};

/// What `setup()` hands back to the embedding compiler: code-buffer
/// extents and the resolved bootstrap endpoint table. Compiler-flag
/// population from this stays an external collaborator's job.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
	pub version_string: String,
	pub code_buffer_addr: u64,
	pub code_buffer_size: u64,
	pub endpoints: Vec<(String, u64)>,
}

/// Construction-time knobs for a serial-attached device (SAM/Due, Metro
/// M0, Teensy LC). Everything that differs between those boards — token
/// direction, hard-reset kind, bundled firmware path — is a field here,
/// not a separate Rust type.
#[derive(Debug, Clone)]
pub struct SerialDeviceConfig {
	pub device_id: String,
	pub path: String,
	pub baud_rate: u32,
	pub send_token_first: bool,
	pub handshake_timeout: Duration,
	pub hard_reset_kind: HardResetKind,
	pub firmware_image: Option<FirmwareImage>,
	pub reconnect_threshold: Duration,
}

/// Construction-time knobs for a TCP-attached device (e.g. a Raspberry Pi
/// running the executor as a network service).
#[derive(Debug, Clone)]
pub struct SocketDeviceConfig {
	pub device_id: String,
	pub host: String,
	pub port: u16,
	pub handshake_timeout: Duration,
}

/// Construction-time knobs for a subprocess-attached device (QEMU).
#[derive(Debug, Clone)]
pub struct SubprocessDeviceConfig {
	pub device_id: String,
	pub command: String,
	pub args: Vec<String>,
	pub handshake_timeout: Duration,
}

/// The device-script façade: `accept_*` builds the session from a
/// per-medium config record, `connect`/`setup`/`call`/`disconnect` mirror
/// the five entry points the embedding compiler drives. One generic type
/// replaces what would otherwise be five near-identical per-device
/// modules (Due, Metro M0, Teensy LC, lm3s811/QEMU, raspi32) — the
/// difference between them is entirely data, carried in the config
/// structs above.
pub struct DeviceSession<H: HostCallbacks> {
	session: Session<H>,
	recovery_cfg: RecoveryConfig,
	flasher: Option<Box<dyn ExternalFlasher>>,
}

impl<H: HostCallbacks> DeviceSession<H> {
	pub fn accept_serial(cfg: &SerialDeviceConfig, host: H) -> Self {
		let handshake_cfg = HandshakeConfig { send_token_first: cfg.send_token_first, timeout: cfg.handshake_timeout };
		let info = ConnectInfo::Serial { path: cfg.path.clone(), baud_rate: cfg.baud_rate };
		let transport = Transport::new(info, handshake_cfg);
		let recovery_cfg = RecoveryConfig {
			device_id: cfg.device_id.clone(),
			hard_reset_kind: cfg.hard_reset_kind,
			firmware_image: cfg.firmware_image.clone(),
			reconnect_threshold: cfg.reconnect_threshold,
		};
		DeviceSession {
			session: Session::new(cfg.device_id.clone(), transport, Endian::Little, host),
			recovery_cfg,
			flasher: None,
		}
	}

	pub fn accept_socket(cfg: &SocketDeviceConfig, host: H) -> Self {
		let handshake_cfg = HandshakeConfig { send_token_first: false, timeout: cfg.handshake_timeout };
		let info = ConnectInfo::Socket { host: cfg.host.clone(), port: cfg.port };
		let transport = Transport::new(info, handshake_cfg);
		let recovery_cfg = RecoveryConfig {
			device_id: cfg.device_id.clone(),
			hard_reset_kind: HardResetKind::None,
			firmware_image: None,
			reconnect_threshold: Duration::from_secs(0),
		};
		DeviceSession {
			session: Session::new(cfg.device_id.clone(), transport, Endian::Little, host),
			recovery_cfg,
			flasher: None,
		}
	}

	pub fn accept_subprocess(cfg: &SubprocessDeviceConfig, host: H) -> Self {
		let handshake_cfg = HandshakeConfig { send_token_first: false, timeout: cfg.handshake_timeout };
		let info = ConnectInfo::Subprocess { command: cfg.command.clone(), args: cfg.args.clone() };
		let transport = Transport::new(info, handshake_cfg);
		let recovery_cfg = RecoveryConfig {
			device_id: cfg.device_id.clone(),
			hard_reset_kind: HardResetKind::KillSubprocess,
			firmware_image: None,
			reconnect_threshold: Duration::from_secs(0),
		};
		DeviceSession {
			session: Session::new(cfg.device_id.clone(), transport, Endian::Little, host),
			recovery_cfg,
			flasher: None,
		}
	}

	/// Installs the external flasher used by the reflash step of serial
	/// recovery. A no-op device family (socket, subprocess) simply never
	/// reaches the code path that would use it.
	pub fn set_flasher(&mut self, flasher: Box<dyn ExternalFlasher>) {
		self.flasher = Some(flasher);
	}

	pub fn set_verbose(&mut self, verbose: bool) {
		self.session.set_verbose(verbose);
	}

	pub fn device_id(&self) -> &str {
		self.session.device_id()
	}

	pub fn connected(&self) -> bool {
		self.session.connected()
	}

	pub fn host_mut(&mut self) -> &mut H {
		self.session.host_mut()
	}

	pub fn connect(&mut self, prompt: &mut dyn RecoveryPrompt) -> Result<(), SessionError> {
		self.session.connect(&self.recovery_cfg, prompt, self.flasher.as_deref())
	}

	pub fn setup(&mut self) -> Result<DeviceProperties, SessionError> {
		let info = self.session.read_setup()?;
		Ok(DeviceProperties {
			version_string: info.version_string,
			code_buffer_addr: info.code_buffer_addr,
			code_buffer_size: info.code_buffer_size,
			endpoints: info.symbols,
		})
	}

	pub fn call(&mut self, logical_name: &str, input: CallInput) -> Result<CallOutput, SessionError> {
		self.session.call(logical_name, input)
	}

	pub fn disconnect(&mut self) -> Result<(), SessionError> {
		self.session.disconnect()
	}
}
