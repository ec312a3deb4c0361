//! Wire protocol.
//!
//! Messages are internally tagged by `type` with camelCase fields. The same
//! types travel as JSON (text frames) or as named `MsgPack` maps
//! (`rmp_serde::to_vec_named()`, binary frames).

pub mod downstream;
pub mod patch;
pub mod upstream;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

pub use downstream::{
    ConnectedBody, Downstream, ErrorBody, ErrorKind, PokeBody, PullResponseBody,
};
pub use patch::{QueryPatchOp, RowPatchOp};
pub use upstream::{
    ChangeDesiredQueriesBody, CrudArgs, CrudKind, CrudOp, InitConnectionBody, Mutation, PullBody,
    PushBody, Upstream, CRUD_MUTATION_NAME,
};

/// Frame encoding. Replies use the encoding of the frame they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    MsgPack,
}

/// # Errors
///
/// [`ProtocolError::Json`] or [`ProtocolError::MsgPack`] for malformed input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], encoding: Encoding) -> Result<T, ProtocolError> {
    match encoding {
        Encoding::Json => Ok(serde_json::from_slice(bytes)?),
        Encoding::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
    }
}

/// # Errors
///
/// [`ProtocolError::Encode`] if the value cannot be represented.
pub fn encode<T: Serialize>(msg: &T, encoding: Encoding) -> Result<Vec<u8>, ProtocolError> {
    match encoding {
        Encoding::Json => serde_json::to_vec(msg).map_err(|e| ProtocolError::Encode(e.to_string())),
        Encoding::MsgPack => {
            rmp_serde::to_vec_named(msg).map_err(|e| ProtocolError::Encode(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::make_row;

    #[test]
    fn msgpack_poke_is_a_named_map_with_type() {
        let mut poke = PokeBody {
            poke_id: "p".into(),
            base_cookie: Some("00".into()),
            cookie: "01".into(),
            ..PokeBody::default()
        };
        poke.rows_patch.push(RowPatchOp::Put {
            table_name: "issue".into(),
            value: make_row([("id", 7)]),
        });
        let msg = Downstream::Poke(poke);
        let bytes = encode(&msg, Encoding::MsgPack).unwrap();

        let raw = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
        let map = raw.as_map().unwrap();
        let tag = map
            .iter()
            .find(|(k, _)| k.as_str() == Some("type"))
            .map(|(_, v)| v.as_str());
        assert_eq!(tag, Some(Some("poke")));

        let back: Downstream = decode(&bytes, Encoding::MsgPack).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let err = decode::<Upstream>(b"{\"type\":\"nope\"}", Encoding::Json).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
