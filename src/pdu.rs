use thiserror::Error;

/// Largest register count a single read request may ask for.
pub const MAX_READ_REGISTERS: i32 = 125;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModbusUnitError {
    #[error("Invalid address: {0} < 0 or {0} > 65535")]
    InvalidAddress(i32),

    #[error("Start address is empty")]
    AddressIsEmpty,

    #[error("Invalid length: {0} < 1 or {0} > {max}", max = MAX_READ_REGISTERS)]
    InvalidLength(i32),

    #[error("Invalid range: {0} + {1} = {2} > 65536")]
    RangeToMatch(i32, i32, i32),

    #[error("Register type is empty")]
    InvalidRegisterType,

    #[error("Empty response received")]
    EmptyResponse,

    #[error("Modbus exception: function code {0:#x}, exception code {1:#x}")]
    ModbusException(u8, u8),

    #[error("Unexpected function code: expected {0:#x}, got {1:#x}")]
    UnexpectedFunctionCode(u8, u8),

    #[error("Invalid response length")]
    InvalidResponseLength,
}

/// Register bank a read is addressed to.
///
/// Holding registers are the primary bank; input registers are tried when the
/// device rejects or garbles a holding read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegisterType {
    HoldingRegister,
    InputRegister,
}

impl RegisterType {
    pub fn read_command(&self) -> u8 {
        match self {
            RegisterType::HoldingRegister => 0x03,
            RegisterType::InputRegister => 0x04,
        }
    }

    /// The other bank.
    pub fn alternate(&self) -> RegisterType {
        match self {
            RegisterType::HoldingRegister => RegisterType::InputRegister,
            RegisterType::InputRegister => RegisterType::HoldingRegister,
        }
    }
}

/// One validated register read: start address, word count and bank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModbusUnit {
    start_addr: u16,
    length: u16,
    register_type: RegisterType,
}

#[derive(Default)]
pub struct ModbusUnitBuilder {
    start_addr: Option<i32>,
    length: Option<i32>,
    register_type: Option<RegisterType>,
}

impl ModbusUnitBuilder {
    pub fn address(&mut self, addr: i32) -> &mut Self {
        self.start_addr = Some(addr);
        self
    }

    pub fn length(&mut self, length: i32) -> &mut Self {
        self.length = Some(length);
        self
    }

    pub fn register_type(&mut self, register_type: RegisterType) -> &mut Self {
        self.register_type = Some(register_type);
        self
    }

    pub fn build(&self) -> Result<ModbusUnit, ModbusUnitError> {
        let start_addr = match self.start_addr {
            Some(addr) => {
                if !(0..=65535).contains(&addr) {
                    return Err(ModbusUnitError::InvalidAddress(addr));
                }
                addr
            }
            None => return Err(ModbusUnitError::AddressIsEmpty),
        };
        let register_type = self
            .register_type
            .ok_or(ModbusUnitError::InvalidRegisterType)?;
        let length = match self.length {
            Some(length) => {
                if !(1..=MAX_READ_REGISTERS).contains(&length) {
                    return Err(ModbusUnitError::InvalidLength(length));
                }
                length
            }
            None => 1,
        };
        // the last register read is start + length - 1, which must still fit u16
        let end_addr = start_addr + length;
        if end_addr > 65536 {
            return Err(ModbusUnitError::RangeToMatch(start_addr, length, end_addr));
        }
        Ok(ModbusUnit {
            start_addr: start_addr as u16,
            length: length as u16,
            register_type,
        })
    }
}

impl ModbusUnit {
    pub fn builder() -> ModbusUnitBuilder {
        ModbusUnitBuilder::default()
    }

    /// Shorthand for a read that has already been range-checked elsewhere.
    pub fn read(
        register_type: RegisterType,
        address: u16,
        length: u16,
    ) -> Result<ModbusUnit, ModbusUnitError> {
        ModbusUnit::builder()
            .address(address as i32)
            .length(length as i32)
            .register_type(register_type)
            .build()
    }

    pub fn start_addr(&self) -> u16 {
        self.start_addr
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    pub fn create_read_request(&self) -> Vec<u8> {
        let mut msg: [u8; 5] = [0; 5];
        msg[0] = self.register_type.read_command();
        msg[1] = (self.start_addr >> 8) as u8;
        msg[2] = self.start_addr as u8;
        msg[3] = (self.length >> 8) as u8;
        msg[4] = self.length as u8;
        Vec::from(msg)
    }

    pub fn parse_response(&self, pdu: &[u8]) -> Result<Vec<u16>, ModbusUnitError> {
        if pdu.is_empty() {
            return Err(ModbusUnitError::EmptyResponse);
        }

        let function_code = pdu[0];

        // Check for Modbus exception (function code | 0x80)
        if (function_code & 0x80) != 0 {
            let exception_code = if pdu.len() > 1 { pdu[1] } else { 0 };
            return Err(ModbusUnitError::ModbusException(function_code, exception_code));
        }

        let expected_fc = self.register_type.read_command();
        if function_code != expected_fc {
            return Err(ModbusUnitError::UnexpectedFunctionCode(expected_fc, function_code));
        }

        self.parse_registers(pdu)
    }

    fn parse_registers(&self, pdu: &[u8]) -> Result<Vec<u16>, ModbusUnitError> {
        if pdu.len() < 2 {
            return Err(ModbusUnitError::InvalidResponseLength);
        }

        let byte_count = pdu[1] as usize;
        let expected_bytes = self.length as usize * 2;

        if byte_count != expected_bytes || pdu.len() < 2 + byte_count {
            return Err(ModbusUnitError::InvalidResponseLength);
        }

        let result = pdu[2..2 + byte_count]
            .chunks_exact(2)
            .map(|pair| ((pair[0] as u16) << 8) | (pair[1] as u16))
            .collect();
        Ok(result)
    }
}
