use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ExternalToolError, RecoveryFailedError, ReplaceFirmwareError, SessionError};
use crate::host::RecoveryPrompt;
use crate::transport::Transport;

/// After a reflash, the device's boot-blink window duplicates the
/// handshake token in the stream if the host starts reading too soon.
/// Preserved as a hard constant until firmware is revised to avoid the
/// race.
const POST_REFLASH_SLEEP: Duration = Duration::from_secs(3);

const SOFT_RESET_WINDOW: Duration = Duration::from_secs(5);

/// How a device family is knocked back into its bootloader. Data, not
/// code: the session's façade picks one of these per device, the recovery
/// logic below is the same for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardResetKind {
	/// 1200-baud open, toggle DTR, close — SAM/Due/Metro M0 family.
	SamFamily1200Baud,
	/// Short 134-baud open — Teensy LC.
	Teensy134Baud,
	/// SIGKILL the subprocess; caller relaunches a fresh child.
	KillSubprocess,
	/// No hard-reset concept for this medium (sockets).
	None,
}

#[derive(Debug, Clone)]
pub struct FirmwareImage {
	pub path: PathBuf,
}

/// Seam for the external flasher invocation (`bossac`, `teensy_loader_cli`,
/// ...). Kept out of this crate because the flasher binaries and their
/// argument conventions are an external collaborator, per scope.
pub trait ExternalFlasher {
	fn flash(&self, image: &FirmwareImage) -> Result<(), ReplaceFirmwareError>;
}

/// Per-device recovery knobs, assembled once by the façade rather than
/// injected through a container.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
	pub device_id: String,
	pub hard_reset_kind: HardResetKind,
	pub firmware_image: Option<FirmwareImage>,
	pub reconnect_threshold: Duration,
}

/// Toggles DTR at 1200 baud (SAM family) or opens briefly at 134 baud
/// (Teensy LC) to signal a hard reset to the boot ROM. A no-op for
/// subprocess/socket media, whose hard reset is handled by the caller
/// (kill the child; there is no socket hard reset).
fn perform_hard_reset(path: &str, kind: HardResetKind) -> Result<(), ExternalToolError> {
	match kind {
		HardResetKind::SamFamily1200Baud => {
			let mut port = serialport::new(path, 1200)
				.open()
				.map_err(|e| ExternalToolError { tool: PathBuf::from(path), reason: e.to_string() })?;
			thread::sleep(Duration::from_millis(22));
			port.write_data_terminal_ready(true)
				.map_err(|e| ExternalToolError { tool: PathBuf::from(path), reason: e.to_string() })?;
			thread::sleep(Duration::from_millis(22));
			port.write_data_terminal_ready(false)
				.map_err(|e| ExternalToolError { tool: PathBuf::from(path), reason: e.to_string() })?;
			Ok(())
		}
		HardResetKind::Teensy134Baud => {
			let _port = serialport::new(path, 134)
				.open()
				.map_err(|e| ExternalToolError { tool: PathBuf::from(path), reason: e.to_string() })?;
			Ok(())
		}
		HardResetKind::KillSubprocess | HardResetKind::None => Ok(()),
	}
}

/// Retries `transport.reset()` + `transport.handshake()` until `window`
/// elapses. Returns `true` as soon as one attempt succeeds.
fn retry_handshake(transport: &mut Transport, window: Duration) -> bool {
	let deadline = Instant::now() + window;
	loop {
		if transport.reset().is_ok() && transport.handshake().is_ok() {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}
		thread::sleep(Duration::from_millis(200));
	}
}

/// Serial/socket/subprocess's automated-only recovery step, tried before
/// ever bothering the user. Subprocess has none: the caller must relaunch
/// a fresh child.
pub fn attempt_auto_recovery(transport: &mut Transport) -> bool {
	if transport.is_subprocess() {
		return false;
	}
	retry_handshake(transport, SOFT_RESET_WINDOW)
}

/// Full cascade: automated retry, then (serial) manual reboot prompt, then
/// (serial) firmware reflash prompt; (socket) a single retry after asking
/// the user to restart the remote executor; (subprocess) always fails —
/// there is nothing this layer can do besides ask the caller to relaunch.
pub fn negotiate_recovery(
	transport: &mut Transport,
	cfg: &RecoveryConfig,
	prompt: &mut dyn RecoveryPrompt,
	flasher: Option<&dyn ExternalFlasher>,
) -> Result<(), SessionError> {
	if attempt_auto_recovery(transport) {
		return Ok(());
	}

	let failed = || SessionError::Recovery(RecoveryFailedError(cfg.device_id.clone()));

	if transport.is_subprocess() {
		return Err(failed());
	}

	if !transport.is_serial() {
		// Socket: ask once, retry once.
		if prompt.confirm("restart the remote executor, then continue")? {
			if retry_handshake(transport, SOFT_RESET_WINDOW) {
				return Ok(());
			}
		}
		return Err(failed());
	}

	// Serial cascade: manual reboot, then reflash.
	if prompt.confirm("press the device's reset button, then continue")? {
		if let Transport::Serial(_) = transport {
			transport.await_reconnect(cfg.reconnect_threshold).ok();
		}
		if retry_handshake(transport, SOFT_RESET_WINDOW) {
			return Ok(());
		}
	}

	let image = match &cfg.firmware_image {
		Some(image) => image,
		None => return Err(failed()),
	};

	if !prompt.confirm("flash the bundled firmware image, then continue")? {
		return Err(failed());
	}

	let flasher = match flasher {
		Some(f) => f,
		None => return Err(failed()),
	};

	// The device must be sitting in its bootloader before the external
	// flasher touches it, or the flash attempt fails against whatever
	// application firmware is still running.
	let path = transport.serial_path().ok_or_else(failed)?.to_owned();
	perform_hard_reset(&path, cfg.hard_reset_kind)?;

	flasher.flash(image).map_err(|_| failed())?;
	thread::sleep(POST_REFLASH_SLEEP);

	if retry_handshake(transport, SOFT_RESET_WINDOW) {
		Ok(())
	} else {
		Err(failed())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct AlwaysDecline;
	impl RecoveryPrompt for AlwaysDecline {
		fn confirm(&mut self, _question: &str) -> Result<bool, crate::error::SessionError> {
			Ok(false)
		}
	}

	#[test]
	fn negotiate_fails_closed_without_firmware_or_confirmation() {
		use crate::transport::HandshakeConfig;
		let mut transport = Transport::socket("127.0.0.1", 1, HandshakeConfig::default());
		let cfg = RecoveryConfig {
			device_id: "test-device".to_owned(),
			hard_reset_kind: HardResetKind::None,
			firmware_image: None,
			reconnect_threshold: Duration::from_millis(10),
		};
		let mut prompt = AlwaysDecline;
		let result = negotiate_recovery(&mut transport, &cfg, &mut prompt, None);
		assert!(result.is_err());
	}
}
