use super::*;

/// Unit id, function code and the byte count (or exception code).
pub const RTU_RESPONSE_HEAD_LEN: usize = 3;

#[derive(Default)]
pub struct ModbusRTUBuilder {
    device_id: Option<u8>,
}

impl ModbusRTUBuilder {
    pub fn device_id(mut self, device_id: u8) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn build(self) -> Result<ModbusRTU, ModbusTransportError> {
        let device_id = self.device_id.ok_or(ModbusTransportError::DeviceIdMissing)?;

        Ok(ModbusRTU { device_id })
    }
}

/// Modbus RTU framing for one slave id.
pub struct ModbusRTU {
    device_id: u8,
}

impl ModbusRTU {
    pub fn builder() -> ModbusRTUBuilder {
        ModbusRTUBuilder::default()
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    /// Generate complete RTU frame for a read request
    pub fn create_read_request(&self, unit: &ModbusUnit) -> Vec<u8> {
        let pdu = unit.create_read_request();
        self.wrap_rtu(pdu)
    }

    /// Parse RTU response and extract register values
    pub fn parse_response(
        &self,
        unit: &ModbusUnit,
        frame: &[u8],
    ) -> Result<Vec<u16>, ModbusTransportError> {
        let pdu = self.unwrap_rtu(frame)?;
        unit.parse_response(pdu).map_err(ModbusTransportError::Protocol)
    }

    /// Full length of a response frame, judged from its first three bytes.
    pub fn expected_response_len(head: &[u8]) -> Result<usize, ModbusTransportError> {
        if head.len() < RTU_RESPONSE_HEAD_LEN {
            return Err(ModbusTransportError::FrameTooShort);
        }
        if head[1] & 0x80 != 0 {
            // unit + fc + exception code + crc
            return Ok(5);
        }
        Ok(RTU_RESPONSE_HEAD_LEN + head[2] as usize + 2)
    }

    fn wrap_rtu(&self, pdu: Vec<u8>) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
        frame.push(self.device_id);
        frame.extend(&pdu);

        let crc = Self::calculate_crc(&frame);
        frame.push(crc as u8);
        frame.push((crc >> 8) as u8);

        frame
    }

    fn unwrap_rtu<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8], ModbusTransportError> {
        if frame.len() < 4 {
            return Err(ModbusTransportError::FrameTooShort);
        }

        let unit_id = frame[0];
        if unit_id != self.device_id {
            return Err(ModbusTransportError::UnitIdMismatch {
                expected: self.device_id,
                received: unit_id,
            });
        }

        let received_crc = (frame[frame.len() - 1] as u16) << 8 | frame[frame.len() - 2] as u16;
        let calculated_crc = Self::calculate_crc(&frame[..frame.len() - 2]);

        if received_crc != calculated_crc {
            return Err(ModbusTransportError::CrcMismatch {
                expected: calculated_crc,
                received: received_crc,
            });
        }

        Ok(&frame[1..frame.len() - 2])
    }

    /// CRC-16/Modbus (reflected poly 0xA001, init 0xFFFF).
    pub fn calculate_crc(data: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for &byte in data {
            crc ^= byte as u16;
            for _ in 0..8 {
                if (crc & 0x0001) != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc
    }
}
