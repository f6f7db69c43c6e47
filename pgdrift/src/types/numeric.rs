//! Binary `numeric` codec: base-10⁴ digit groups, as described on the wire
//! format page <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
use bytes::Buf;
use rust_decimal::Decimal;

use crate::{
    Decode, DecodeError, Encode,
    encode::Encoded,
    postgres::{Oid, PgType},
    row::Column,
};

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;

impl Decode for Decimal {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.oid() != Self::OID {
            return Err(DecodeError::OidMissmatch);
        }
        let mut value = column.try_into_value()?;
        if value.len() < 8 {
            return Err(DecodeError::OidMissmatch);
        }

        let ndigits = value.get_i16();
        let weight = value.get_i16();
        let sign = value.get_u16();
        let dscale = value.get_u16();

        if sign == SIGN_NAN {
            return Err(DecodeError::OidMissmatch);
        }

        if ndigits == 0 {
            return Ok(Decimal::new(0, dscale as u32));
        }

        let mut digit_concat: i128 = 0;
        for _ in 0..ndigits {
            digit_concat = digit_concat * 10_000 + value.get_i16() as i128;
        }

        // value == digit_concat * 10^(4*(weight - ndigits + 1))
        let exponent = 4 * (weight as i32 - ndigits as i32 + 1);
        let extra = exponent + dscale as i32;

        let mantissa = if extra >= 0 {
            digit_concat * 10i128.pow(extra as u32)
        } else {
            digit_concat / 10i128.pow((-extra) as u32)
        };

        let mantissa = if sign == SIGN_NEG { -mantissa } else { mantissa };

        Ok(Decimal::from_i128_with_scale(mantissa, dscale as u32))
    }
}

impl Encode<'static> for Decimal {
    const OID: Oid = <Decimal as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        let dscale = self.scale();
        let negative = self.is_sign_negative();
        let mantissa = self.mantissa().unsigned_abs().to_string();

        let digits_str = if (mantissa.len() as u32) <= dscale {
            format!("{:0>width$}", mantissa, width = dscale as usize + 1)
        } else {
            mantissa
        };

        let split = digits_str.len() - dscale as usize;
        let (int_part, frac_part) = digits_str.split_at(split);

        let int_pad = (4 - int_part.len() % 4) % 4;
        let int_padded = format!("{:0>width$}", int_part, width = int_part.len() + int_pad);

        let frac_pad = (4 - frac_part.len() % 4) % 4;
        let frac_padded = format!("{frac_part:0<width$}", width = frac_part.len() + frac_pad);

        let mut groups: Vec<u16> = int_padded
            .as_bytes()
            .chunks(4)
            .chain(frac_padded.as_bytes().chunks(4))
            .filter(|c| !c.is_empty())
            .map(|c| std::str::from_utf8(c).unwrap().parse().unwrap())
            .collect();

        let mut weight = (int_padded.len() / 4) as i16 - 1;

        while groups.first() == Some(&0) && groups.len() > 1 {
            groups.remove(0);
            weight -= 1;
        }
        while groups.last() == Some(&0) && groups.len() > 1 {
            groups.pop();
        }
        if groups == [0] {
            groups.clear();
            weight = 0;
        }

        let mut buf = Vec::with_capacity(8 + groups.len() * 2);
        buf.extend_from_slice(&(groups.len() as i16).to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&(if negative { SIGN_NEG } else { SIGN_POS }).to_be_bytes());
        buf.extend_from_slice(&(dscale as u16).to_be_bytes());
        for digit in groups {
            buf.extend_from_slice(&digit.to_be_bytes());
        }

        Encoded::owned(buf, Self::OID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digit_groups(s: &str) -> (i16, i16, u16, u16, Vec<u16>) {
        let d: Decimal = s.parse().unwrap();
        let encoded = d.encode();
        let mut bytes = bytes::Bytes::copy_from_slice(encoded.value().unwrap());
        let ndigits = bytes.get_i16();
        let weight = bytes.get_i16();
        let sign = bytes.get_u16();
        let dscale = bytes.get_u16();
        let digits = (0..ndigits).map(|_| bytes.get_i16() as u16).collect();
        (ndigits, weight, sign, dscale, digits)
    }

    #[test]
    fn encodes_integer_as_single_group() {
        let (ndigits, weight, sign, _, digits) = digit_groups("1234");
        assert_eq!(ndigits, 1);
        assert_eq!(weight, 0);
        assert_eq!(sign, SIGN_POS);
        assert_eq!(digits, [1234]);
    }

    #[test]
    fn encodes_negative_fraction() {
        let (_, _, sign, dscale, _) = digit_groups("-0.0001");
        assert_eq!(sign, SIGN_NEG);
        assert_eq!(dscale, 4);
    }

    #[test]
    fn zero_has_no_digit_groups() {
        let (ndigits, _, sign, _, digits) = digit_groups("0");
        assert_eq!(ndigits, 0);
        assert_eq!(sign, SIGN_POS);
        assert!(digits.is_empty());
    }
}
