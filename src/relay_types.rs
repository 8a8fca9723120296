use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::str::FromStr;
use thiserror::Error;

/// First coil of the relay block on the device.
pub const COIL_BLOCK_BASE: u16 = 0;

/// Number of coils read per relay state query.
pub const COIL_BLOCK_SIZE: u16 = 8;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayId {
    Relay1,
    Relay2,
    Relay3,
    Relay4,
    Relay5,
    Relay6,
    Relay7,
    Relay8,
}

impl RelayId {
    pub const ALL: [RelayId; 8] = [
        RelayId::Relay1,
        RelayId::Relay2,
        RelayId::Relay3,
        RelayId::Relay4,
        RelayId::Relay5,
        RelayId::Relay6,
        RelayId::Relay7,
        RelayId::Relay8,
    ];

    /// Operator facing, 1-based relay number.
    pub fn number(&self) -> u8 {
        match self {
            RelayId::Relay1 => 1,
            RelayId::Relay2 => 2,
            RelayId::Relay3 => 3,
            RelayId::Relay4 => 4,
            RelayId::Relay5 => 5,
            RelayId::Relay6 => 6,
            RelayId::Relay7 => 7,
            RelayId::Relay8 => 8,
        }
    }

    /// Zero-based coil address on the wire.
    pub fn coil(&self) -> u16 {
        COIL_BLOCK_BASE + u16::from(self.number() - 1)
    }

    /// Position of this relay inside the block returned by a coil read.
    pub fn bit_index(&self) -> usize {
        usize::from(self.number() - 1)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid relay number '{0}', expected 1 to 8")]
pub struct InvalidRelayId(pub String);

impl TryFrom<u8> for RelayId {
    type Error = InvalidRelayId;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        match number {
            1..=8 => Ok(RelayId::ALL[usize::from(number - 1)]),
            unknown => Err(InvalidRelayId(unknown.to_string())),
        }
    }
}

impl FromStr for RelayId {
    type Err = InvalidRelayId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s
            .trim()
            .parse::<u8>()
            .map_err(|_| InvalidRelayId(s.to_string()))?;
        RelayId::try_from(number)
    }
}

impl Display for RelayId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Relay{}", self.number())
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    pub fn is_on(&self) -> bool {
        *self == RelayState::On
    }
}

impl From<bool> for RelayState {
    fn from(value: bool) -> Self {
        match value {
            true => RelayState::On,
            false => RelayState::Off,
        }
    }
}

impl From<RelayState> for bool {
    fn from(state: RelayState) -> Self {
        state.is_on()
    }
}

impl Display for RelayState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            RelayState::On => write!(f, "On"),
            RelayState::Off => write!(f, "Off"),
        }
    }
}

/// Modbus unit id of the relay board.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct SlaveId(pub u8);

impl Display for SlaveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}
