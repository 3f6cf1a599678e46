use std::convert::TryFrom;

use crate::error::FrameError;

/// The six message kinds carried on the wire. Numeric values are part of the
/// protocol and must not be renumbered (see [`Opcode::Return`] / [`Opcode::Call`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Opcode {
	Connect = 0,
	Disconnect = 1,
	Return = 2,
	Call = 3,
	Result = 4,
	StdOut = 5,
}

impl Opcode {
	pub fn name(self) -> &'static str {
		match self {
			Opcode::Connect => "Connect",
			Opcode::Disconnect => "Disconnect",
			Opcode::Return => "Return",
			Opcode::Call => "Call",
			Opcode::Result => "Result",
			Opcode::StdOut => "StdOut",
		}
	}
}

impl std::fmt::Display for Opcode {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.name())
	}
}

impl TryFrom<u64> for Opcode {
	type Error = FrameError;

	fn try_from(value: u64) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Opcode::Connect),
			1 => Ok(Opcode::Disconnect),
			2 => Ok(Opcode::Return),
			3 => Ok(Opcode::Call),
			4 => Ok(Opcode::Result),
			5 => Ok(Opcode::StdOut),
			other => Err(FrameError::UnknownOpcode(other)),
		}
	}
}
