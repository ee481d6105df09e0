//! Pluggable persistence surface for state data.

use crate::descriptor::short_type_name;
use crate::error::HandlerFault;
use crate::eventual::Payload;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::marker::PhantomData;

/// Round-trips a state's data value through JSON. The executing runtime
/// decides when (and whether) to persist; the core only carries the codec
/// on the node build info.
pub trait StateDataCodec: Send + Sync {
    /// Name of the data type this codec understands.
    fn data_type(&self) -> &str;

    fn encode(&self, data: &(dyn Any + Send)) -> Result<serde_json::Value, HandlerFault>;

    fn decode(&self, value: serde_json::Value) -> Result<Payload, HandlerFault>;
}

/// Serde-backed codec for any serializable data type.
pub struct JsonCodec<D> {
    type_name: String,
    _data: PhantomData<fn() -> D>,
}

impl<D> JsonCodec<D> {
    pub fn new() -> Self {
        JsonCodec {
            type_name: short_type_name::<D>().to_string(),
            _data: PhantomData,
        }
    }
}

impl<D> Default for JsonCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> StateDataCodec for JsonCodec<D>
where
    D: Serialize + DeserializeOwned + Any + Send,
{
    fn data_type(&self) -> &str {
        &self.type_name
    }

    fn encode(&self, data: &(dyn Any + Send)) -> Result<serde_json::Value, HandlerFault> {
        let data = data.downcast_ref::<D>().ok_or_else(|| {
            HandlerFault::new(format!("value is not a '{}'", self.type_name))
        })?;
        serde_json::to_value(data)
            .map_err(|err| HandlerFault::new(format!("encoding '{}': {err}", self.type_name)))
    }

    fn decode(&self, value: serde_json::Value) -> Result<Payload, HandlerFault> {
        serde_json::from_value::<D>(value)
            .map(|data| Box::new(data) as Payload)
            .map_err(|err| HandlerFault::new(format!("decoding '{}': {err}", self.type_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        attempts: u32,
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec::<Session>::new();
        assert_eq!(codec.data_type(), "Session");

        let original = Session {
            user: "ada".into(),
            attempts: 3,
        };
        let encoded = codec.encode(&original).unwrap();
        let decoded = codec.decode(encoded).unwrap();
        assert_eq!(decoded.downcast_ref::<Session>(), Some(&original));
    }

    #[test]
    fn mistyped_value_is_a_fault() {
        let codec = JsonCodec::<Session>::new();
        assert!(codec.encode(&42u32).is_err());
    }
}
