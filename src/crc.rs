//! CRC-16/MODBUS as used on the inverter-facing bus, in both directions.

/// Computes the MODBUS variant of CRC-16: initial value `0xFFFF`,
/// reflected polynomial `0xA001`, bytes folded in LSB-first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Read request for register 0x0001 from slave 1
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x01]), 0xCAD5);
        // Read request for register 0x0010
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x01]), 0xCF85);
    }

    #[test]
    fn empty_input_is_initial_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn single_bit_corruption_changes_crc() {
        let frame = [0x01, 0x03, 0x00, 0x01, 0x00, 0x01];
        let mut corrupted = frame;
        corrupted[3] ^= 0x01;
        assert_ne!(crc16(&frame), crc16(&corrupted));
    }
}
