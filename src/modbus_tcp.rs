use super::*;

/// MBAP header: transaction id, protocol id, length, unit id.
pub const MBAP_HEADER_LEN: usize = 7;

#[derive(Default)]
pub struct ModbusTCPBuilder {
    device_id: Option<u8>,
}

impl ModbusTCPBuilder {
    pub fn device_id(mut self, device_id: u8) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn build(self) -> Result<ModbusTCP, ModbusTransportError> {
        let device_id = self.device_id.ok_or(ModbusTransportError::DeviceIdMissing)?;

        Ok(ModbusTCP {
            transaction_id: 0,
            device_id,
        })
    }
}

/// Modbus TCP framing for one unit id.
///
/// Every request bumps the transaction id; a response is only accepted when it
/// echoes the id of the most recent request.
pub struct ModbusTCP {
    transaction_id: u16,
    device_id: u8,
}

impl ModbusTCP {
    pub fn builder() -> ModbusTCPBuilder {
        ModbusTCPBuilder::default()
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Generate complete TCP frame for a read request
    pub fn create_read_request(&mut self, unit: &ModbusUnit) -> Vec<u8> {
        let pdu = unit.create_read_request();
        self.wrap_tcp(pdu)
    }

    /// Parse TCP response and extract register values
    pub fn parse_response(
        &self,
        unit: &ModbusUnit,
        frame: &[u8],
    ) -> Result<Vec<u16>, ModbusTransportError> {
        let pdu = self.unwrap_tcp(frame)?;
        unit.parse_response(pdu).map_err(ModbusTransportError::Protocol)
    }

    /// Number of bytes that follow the MBAP header, read from its length field.
    pub fn remaining_length(header: &[u8]) -> Result<usize, ModbusTransportError> {
        if header.len() < MBAP_HEADER_LEN {
            return Err(ModbusTransportError::FrameTooShort);
        }
        let length = ((header[4] as u16) << 8) | (header[5] as u16);
        if length < 2 {
            // unit id plus at least a function code
            return Err(ModbusTransportError::FrameTooShort);
        }
        Ok(length as usize - 1)
    }

    /// Transaction id carried by a (possibly stale) response header.
    pub fn response_transaction_id(frame: &[u8]) -> Option<u16> {
        (frame.len() >= 2).then(|| ((frame[0] as u16) << 8) | (frame[1] as u16))
    }

    fn wrap_tcp(&mut self, pdu: Vec<u8>) -> Vec<u8> {
        self.transaction_id = self.transaction_id.wrapping_add(1);

        let length = (pdu.len() + 1) as u16;
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());

        frame.push((self.transaction_id >> 8) as u8);
        frame.push(self.transaction_id as u8);
        frame.push(0x00);
        frame.push(0x00);
        frame.push((length >> 8) as u8);
        frame.push(length as u8);
        frame.push(self.device_id);
        frame.extend(pdu);

        frame
    }

    fn unwrap_tcp<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8], ModbusTransportError> {
        if frame.len() < MBAP_HEADER_LEN {
            return Err(ModbusTransportError::FrameTooShort);
        }

        let transaction_id = ((frame[0] as u16) << 8) | (frame[1] as u16);
        if transaction_id != self.transaction_id {
            return Err(ModbusTransportError::TransactionIdMismatch {
                expected: self.transaction_id,
                received: transaction_id,
            });
        }

        let protocol_id = ((frame[2] as u16) << 8) | (frame[3] as u16);
        if protocol_id != 0 {
            return Err(ModbusTransportError::InvalidProtocolId(protocol_id));
        }

        let unit_id = frame[6];
        if unit_id != self.device_id {
            return Err(ModbusTransportError::UnitIdMismatch {
                expected: self.device_id,
                received: unit_id,
            });
        }

        let length = ((frame[4] as u16) << 8) | (frame[5] as u16);
        let expected_len = 6 + length as usize;

        if length < 1 || frame.len() < expected_len {
            return Err(ModbusTransportError::FrameTooShort);
        }

        Ok(&frame[MBAP_HEADER_LEN..expected_len])
    }
}
