use std::io::{self, Write};

use crate::endian::Endian;
use crate::error::SessionError;

/// How to render a `Call`'s pending expression value once its `Return`
/// has arrived. `CStringAt` tells the session to issue a nested
/// `memory.read.cstr` before emitting the formatted text; the host decides
/// *whether* to dereference, the session performs the actual nested call
/// (it owns the channel).
#[derive(Debug, Clone)]
pub enum ResultFormat {
	Plain(String),
	CStringAt(u64),
}

/// The seam between this crate and the embedding compiler: routes the
/// `jit` stream (verbatim device stdout — data, not diagnostics, so never
/// through `log`) and decides how to format an expression result.
pub trait HostCallbacks {
	fn jit_output(&mut self, text: &str);

	/// `type_name` is the static type of the expression the device just
	/// evaluated, as known by the caller of `call`; `None` when the call
	/// wasn't an expression evaluation.
	fn format_result(&mut self, type_name: Option<&str>, raw: &[u8], endian: Endian) -> ResultFormat;
}

/// Default [`HostCallbacks`] for local testing and examples: `jit` goes to
/// real stdout, result formatting recognises `char *`/`const char *` and
/// otherwise renders the raw bytes as a hex string.
pub struct StdHost;

impl StdHost {
	pub fn new() -> Self {
		StdHost
	}
}

impl Default for StdHost {
	fn default() -> Self {
		Self::new()
	}
}

impl HostCallbacks for StdHost {
	fn jit_output(&mut self, text: &str) {
		print!("{text}");
		let _ = io::stdout().flush();
	}

	fn format_result(&mut self, type_name: Option<&str>, raw: &[u8], endian: Endian) -> ResultFormat {
		match type_name {
			// The result body carries the raw 4-byte address on these
			// (32-bit) targets, not a full 8-byte field.
			Some("char *") | Some("const char *") if raw.len() >= 4 => {
				ResultFormat::CStringAt(u64::from(endian.read_raw_u32(&raw[0..4])))
			}
			_ => {
				let hex = raw.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("");
				ResultFormat::Plain(hex)
			}
		}
	}
}

/// Drives an interactive recovery decision with the y/n/q/a semantics of
/// the original `ask()` loop: `y`/`n` answer once, `a` answers this and
/// every subsequent question the same way for the lifetime of the prompt
/// instance, `q` cancels recovery outright.
pub trait RecoveryPrompt {
	fn confirm(&mut self, question: &str) -> Result<bool, SessionError>;
}

/// Reads y/n/q/a from stdin. `sticky` remembers an `a` answer so later
/// calls to `confirm` short-circuit without re-prompting.
pub struct StdRecoveryPrompt {
	sticky: Option<bool>,
}

impl StdRecoveryPrompt {
	pub fn new() -> Self {
		StdRecoveryPrompt { sticky: None }
	}
}

impl Default for StdRecoveryPrompt {
	fn default() -> Self {
		Self::new()
	}
}

impl RecoveryPrompt for StdRecoveryPrompt {
	fn confirm(&mut self, question: &str) -> Result<bool, SessionError> {
		if let Some(answer) = self.sticky {
			return Ok(answer);
		}
		loop {
			print!("{question} [y/n/q/a] ");
			io::stdout().flush().ok();
			let mut line = String::new();
			io::stdin().read_line(&mut line)?;
			match line.trim().to_lowercase().as_str() {
				"y" => return Ok(true),
				"n" => return Ok(false),
				"a" => {
					self.sticky = Some(true);
					return Ok(true);
				}
				"q" => return Err(SessionError::UserInterrupt),
				_ => continue,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn format_result_dereferences_char_pointer() {
		let mut host = StdHost::new();
		let raw: [u8; 4] = [0x00, 0x20, 0x00, 0x20];
		match host.format_result(Some("char *"), &raw, Endian::Little) {
			ResultFormat::CStringAt(addr) => assert_eq!(addr, 0x2000_2000),
			ResultFormat::Plain(_) => panic!("expected CStringAt"),
		}
	}

	#[test]
	fn format_result_defaults_to_hex() {
		let mut host = StdHost::new();
		match host.format_result(Some("int"), &[0x2a, 0x00, 0x00, 0x00], Endian::Little) {
			ResultFormat::Plain(s) => assert_eq!(s, "2a000000"),
			ResultFormat::CStringAt(_) => panic!("expected Plain"),
		}
	}

	#[test]
	fn sticky_answer_short_circuits() {
		let mut prompt = StdRecoveryPrompt::new();
		prompt.sticky = Some(false);
		assert_eq!(prompt.confirm("anything").unwrap(), false);
	}
}
