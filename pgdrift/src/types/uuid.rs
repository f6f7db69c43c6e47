use uuid::Uuid;

use crate::{
    Decode, DecodeError, Encode,
    encode::Encoded,
    postgres::{Oid, PgType},
    row::Column,
};

impl Decode for Uuid {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.oid() != Self::OID {
            return Err(DecodeError::OidMissmatch);
        }
        let value = column.try_into_value()?;
        let bytes: [u8; 16] = value[..]
            .try_into()
            .map_err(|_| DecodeError::OidMissmatch)?;
        Ok(Uuid::from_bytes(bytes))
    }
}

impl Encode<'static> for Uuid {
    const OID: Oid = <Uuid as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self.into_bytes().to_vec(), Self::OID)
    }
}
