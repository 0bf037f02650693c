use a3ot_modbus_driver::{Endian, RegisterDecoder};

#[cfg(test)]
mod word_order_tests {
    use super::*;

    const WORDS: [u16; 2] = [0x1234, 0x5678];

    #[test]
    fn test_big_word_big_byte() {
        let decoder = RegisterDecoder::new(Endian::Big, Endian::Big);
        assert_eq!(decoder.decode(&WORDS, 2), Some(0x12345678));
    }

    #[test]
    fn test_little_word_big_byte() {
        let decoder = RegisterDecoder::new(Endian::Little, Endian::Big);
        assert_eq!(decoder.decode(&WORDS, 2), Some(0x56781234));
    }

    #[test]
    fn test_big_word_little_byte() {
        let decoder = RegisterDecoder::new(Endian::Big, Endian::Little);
        assert_eq!(decoder.decode(&WORDS, 2), Some(0x34127856));
    }

    #[test]
    fn test_little_word_little_byte() {
        let decoder = RegisterDecoder::new(Endian::Little, Endian::Little);
        assert_eq!(decoder.decode(&WORDS, 2), Some(0x78563412));
    }

    #[test]
    fn test_default_is_big_endian() {
        assert_eq!(RegisterDecoder::default().decode(&WORDS, 2), Some(0x12345678));
    }
}

#[cfg(test)]
mod single_register_tests {
    use super::*;

    #[test]
    fn test_word_order_ignored_for_one_register() {
        for word_order in [Endian::Big, Endian::Little] {
            let decoder = RegisterDecoder::new(word_order, Endian::Big);
            assert_eq!(decoder.decode_scaled(&[0x00F0], 1, 2.0, 0.0), Some(480.0));
        }
    }

    #[test]
    fn test_little_byte_order_swaps_register() {
        let decoder = RegisterDecoder::new(Endian::Big, Endian::Little);
        assert_eq!(decoder.decode(&[0x00F0], 1), Some(0xF000));
    }

    #[test]
    fn test_offset_applied_after_scale() {
        let decoder = RegisterDecoder::default();
        assert_eq!(decoder.decode_scaled(&[100], 1, 0.5, -10.0), Some(40.0));
    }

    #[test]
    fn test_extra_words_ignored() {
        let decoder = RegisterDecoder::default();
        assert_eq!(decoder.decode(&[0x0001, 0xFFFF], 1), Some(1));
    }
}

#[cfg(test)]
mod rejection_tests {
    use super::*;

    #[test]
    fn test_short_input() {
        let decoder = RegisterDecoder::default();
        assert_eq!(decoder.decode(&[0x1234], 2), None);
        assert_eq!(decoder.decode(&[], 1), None);
        assert_eq!(decoder.decode_scaled(&[], 1, 1.0, 0.0), None);
    }

    #[test]
    fn test_unsupported_length() {
        let decoder = RegisterDecoder::default();
        assert_eq!(decoder.decode(&[1, 2, 3], 3), None);
        assert_eq!(decoder.decode(&[1], 0), None);
    }

    #[test]
    fn test_endian_from_str() {
        assert_eq!("Little".parse::<Endian>(), Ok(Endian::Little));
        assert_eq!(" big ".parse::<Endian>(), Ok(Endian::Big));
        assert!("middle".parse::<Endian>().is_err());
        assert_eq!(Endian::Little.to_string(), "little");
    }
}
