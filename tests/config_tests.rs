use std::time::Duration;

use a3ot_modbus_driver::{ConnectionConfig, DriverKind, Parity, PollingOptions, ReadingOrigin};

#[cfg(test)]
mod connection_tests {
    use super::*;

    #[test]
    fn test_parse_tcp_connection() {
        let json = r#"{"type": "modbus_tcp", "host": "10.0.0.5", "port": 5021, "slave_id": 3}"#;

        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), DriverKind::ModbusTcp);
        assert_eq!(config.resolved_driver_id(), "modbus_tcp_5021");

        let ConnectionConfig::Tcp(tcp) = &config else {
            panic!("expected a tcp connection");
        };
        assert_eq!(tcp.unit_id, 3);
        assert_eq!(tcp.socket_addr(), "10.0.0.5:5021");
        assert_eq!(tcp.options, PollingOptions::default());
    }

    #[test]
    fn test_tcp_defaults() {
        let json = r#"{"type": "modbus_tcp", "host": "plc.local"}"#;

        let ConnectionConfig::Tcp(tcp) = serde_json::from_str(json).unwrap() else {
            panic!("expected a tcp connection");
        };
        assert_eq!(tcp.port, 502);
        assert_eq!(tcp.unit_id, 1);
        assert_eq!(tcp.driver_id, None);
    }

    #[test]
    fn test_parse_serial_connection() {
        let json = r#"{
            "type": "modbus_rtu",
            "port": "/dev/ttyUSB1",
            "baudrate": 19200,
            "parity": "E",
            "stopbits": 2,
            "read_start_address": 100,
            "options": {"poll_interval_ms": 250}
        }"#;

        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), DriverKind::ModbusRtu);
        assert_eq!(config.resolved_driver_id(), "modbus_rtu_ttyUSB1");
        assert_eq!(config.options().poll_interval(), Duration::from_millis(250));
        assert_eq!(config.options().retry_backoff(), Duration::from_millis(10));

        let ConnectionConfig::Serial(serial) = &config else {
            panic!("expected a serial connection");
        };
        assert_eq!(serial.baud, 19200);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stop_bits, 2);
        assert_eq!(serial.data_bits, 8);
        assert_eq!(serial.read_start_address, Some(100));
    }

    #[test]
    fn test_windows_device_name() {
        let json = r#"{"type": "modbus_rtu", "port": "COM3"}"#;

        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.resolved_driver_id(), "modbus_rtu_COM3");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type": "bacnet", "host": "x"}"#;
        assert!(serde_json::from_str::<ConnectionConfig>(json).is_err());
    }
}

#[cfg(test)]
mod origin_tests {
    use super::*;

    #[test]
    fn test_serial_origin_has_no_port() {
        let json = r#"{"type": "modbus_rtu", "port": "/dev/ttyS0", "unit_id": 9}"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();

        let origin = ReadingOrigin::from_connection(&config);
        assert_eq!(origin.source, "/dev/ttyS0");
        assert_eq!(origin.host, "/dev/ttyS0");
        assert_eq!(origin.port, None);
        assert_eq!(origin.unit_id, 9);
        assert_eq!(origin.driver_id, "modbus_rtu_ttyS0");
    }
}
