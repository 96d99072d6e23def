//! Data Coding Scheme (3GPP 23.038) interpretation: selects the user-data
//! alphabet and, when applicable, the message class.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    Gsm7,
    EightBit,
    Ucs2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dcs {
    pub alphabet: Alphabet,
    pub class: Option<u8>,
}

/// Decode a raw DCS octet into an alphabet and optional class.
pub fn decode(dcs: u8) -> Dcs {
    let group = dcs >> 4;
    match group {
        0x0..=0x3 => {
            let alphabet = match (dcs >> 2) & 0x03 {
                0 => Alphabet::Gsm7,
                1 => Alphabet::EightBit,
                2 => Alphabet::Ucs2,
                _ => Alphabet::Gsm7,
            };
            // Bit 4 (the low bit of `group`, since group = dcs >> 4) marks
            // the class field meaningful; groups 0x0/0x2 carry no class.
            let class = if group & 0x01 != 0 { Some(dcs & 0x03) } else { None };
            Dcs { alphabet, class }
        }
        0xC | 0xD => Dcs { alphabet: Alphabet::Gsm7, class: None },
        0xE => Dcs { alphabet: Alphabet::Ucs2, class: None },
        0xF => {
            let alphabet = if dcs & 0x04 != 0 { Alphabet::EightBit } else { Alphabet::Gsm7 };
            Dcs { alphabet, class: Some(dcs & 0x03) }
        }
        _ => Dcs { alphabet: Alphabet::Gsm7, class: None },
    }
}

/// Encode an alphabet and class into a DCS octet using the general coding
/// group (0x0) form. `class == 0` is treated as "no class requested" (the
/// common default) and leaves bit 4 clear; a nonzero class sets bit 4 to
/// mark it meaningful.
pub fn encode(alphabet: Alphabet, class: u8) -> u8 {
    let alpha_bits = match alphabet {
        Alphabet::Gsm7 => 0,
        Alphabet::EightBit => 1,
        Alphabet::Ucs2 => 2,
    };
    if class == 0 {
        alpha_bits << 2
    } else {
        0x10 | (alpha_bits << 2) | (class & 0x03)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_group_zero() {
        let dcs = decode(0x00);
        assert_eq!(dcs.alphabet, Alphabet::Gsm7);
    }

    #[test]
    fn ucs2_group_e() {
        let dcs = decode(0xE0);
        assert_eq!(dcs.alphabet, Alphabet::Ucs2);
        assert_eq!(dcs.class, None);
    }

    #[test]
    fn group_f_eight_bit() {
        let dcs = decode(0xF4);
        assert_eq!(dcs.alphabet, Alphabet::EightBit);
        assert_eq!(dcs.class, Some(0));
    }

    #[test]
    fn encode_zero_class_leaves_bit4_clear() {
        assert_eq!(encode(Alphabet::Gsm7, 0), 0x00);
        assert_eq!(encode(Alphabet::Ucs2, 0), 0x08);
    }

    #[test]
    fn encode_nonzero_class_sets_bit4() {
        assert_eq!(encode(Alphabet::Gsm7, 1), 0x11);
    }
}
