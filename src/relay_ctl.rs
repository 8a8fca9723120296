use log::debug;
use log::info;

use crate::modbus_shim::ConnectError;
use crate::modbus_shim::TransportClient;
use crate::modbus_shim::TransportError;
use crate::relay_types::RelayId;
use crate::relay_types::RelayState;
use crate::relay_types::RelayState::*;
use crate::relay_types::SlaveId;
use crate::relay_types::COIL_BLOCK_BASE;
use crate::relay_types::COIL_BLOCK_SIZE;

/// Drives the relays of one Modbus unit.
///
/// Every state change is read-before-write and read-after-write, so repeated
/// calls with the same desired state never touch the bus with a write and the
/// returned state is always the one the device reports.
pub struct RelayController<T: TransportClient> {
    transport: T,
    slave: SlaveId,
}

impl<T: TransportClient> RelayController<T> {
    pub fn new(transport: T, slave: SlaveId) -> RelayController<T> {
        RelayController { transport, slave }
    }

    pub fn slave(&self) -> SlaveId {
        self.slave
    }

    pub fn connect(&mut self) -> Result<(), ConnectError> {
        self.transport.connect()
    }

    pub fn close(&mut self) {
        self.transport.close()
    }

    pub fn read_relay_state(&mut self, relay: RelayId) -> Result<RelayState, TransportError> {
        let coils = self
            .transport
            .read_coils(COIL_BLOCK_BASE, COIL_BLOCK_SIZE, self.slave)?;
        match coils.get(relay.bit_index()) {
            Some(coil) => Ok(RelayState::from(*coil)),
            None => Err(TransportError::ShortResponse {
                operation: "read coils",
                expected: usize::from(COIL_BLOCK_SIZE),
                actual: coils.len(),
            }),
        }
    }

    pub fn set_relay_status(
        &mut self,
        desired: RelayState,
        relay: RelayId,
    ) -> Result<RelayState, TransportError> {
        let current = self.read_relay_state(relay)?;
        if current == desired {
            debug!("'{}' already '{}'", relay, current);
            return Ok(current);
        }
        info!("Set '{}' to '{}'", relay, desired);
        self.transport
            .write_coil(relay.coil(), desired.is_on(), self.slave)?;
        self.read_relay_state(relay)
    }

    pub fn turn_on(&mut self, relay: RelayId) -> Result<RelayState, TransportError> {
        self.set_relay_status(On, relay)
    }

    pub fn turn_off(&mut self, relay: RelayId) -> Result<RelayState, TransportError> {
        self.set_relay_status(Off, relay)
    }
}
