// Copyright 2025 The execmux Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The wire format: a typed value grammar, its opcode serialization,
//! and the message envelope that multiplexes channels over one
//! transport.

pub mod deserialize;
pub mod serialize;
pub mod value;

use crate::error::SerializeError;
use crate::error::UnserializeError;
use crate::transport::TransportRead;
use crate::wire::deserialize::Deserializer;
use crate::wire::serialize::Serializer;
use crate::wire::value::Value;

const MSGTYPE_STATUS: i64 = 0;
const MSGTYPE_CHANNEL_EXEC: i64 = 1;
const MSGTYPE_CHANNEL_DATA: i64 = 2;
const MSGTYPE_CHANNEL_CLOSE: i64 = 3;
const MSGTYPE_CHANNEL_CLOSE_ERROR: i64 = 4;
const MSGTYPE_CHANNEL_LAST_MESSAGE: i64 = 5;
const MSGTYPE_GATEWAY_TERMINATE: i64 = 6;

/// One frame on the wire: `(msgtype, channel id, payload)`.
#[derive(Debug)]
pub(crate) enum Message {
    /// Request a status report; the reply arrives as CHANNEL_DATA on
    /// the sender-chosen id.
    Status { id: u32 },
    /// Schedule execution of a named entry with a channel bound.
    ChannelExec { id: u32, payload: Value },
    ChannelData { id: u32, payload: Value },
    ChannelClose { id: u32 },
    ChannelCloseError { id: u32, payload: Value },
    /// The sender will never receive again on this channel, but the
    /// other side may keep sending until it closes itself.
    ChannelLastMessage { id: u32 },
    GatewayTerminate,
}

impl Message {
    /// Serializes the whole message into one atomic frame. Borrows the
    /// payload: the caller drops the message (and any channel handles
    /// inside it) only after the frame went out.
    pub(crate) fn to_frame(&self) -> Result<Vec<u8>, SerializeError> {
        let empty = Value::Str(String::new());
        let (msgtype, id, payload) = match self {
            Self::Status { id } => (MSGTYPE_STATUS, *id, &empty),
            Self::ChannelExec { id, payload } => (MSGTYPE_CHANNEL_EXEC, *id, payload),
            Self::ChannelData { id, payload } => (MSGTYPE_CHANNEL_DATA, *id, payload),
            Self::ChannelClose { id } => (MSGTYPE_CHANNEL_CLOSE, *id, &empty),
            Self::ChannelCloseError { id, payload } => (MSGTYPE_CHANNEL_CLOSE_ERROR, *id, payload),
            Self::ChannelLastMessage { id } => (MSGTYPE_CHANNEL_LAST_MESSAGE, *id, &empty),
            Self::GatewayTerminate => (MSGTYPE_GATEWAY_TERMINATE, 0, &empty),
        };
        Serializer::new().save_message(msgtype, id, payload)
    }

    /// Reads and decodes the next frame from the stream.
    pub(crate) fn read_from<R: TransportRead>(
        de: &mut Deserializer<'_, R>,
    ) -> Result<Self, UnserializeError> {
        let frame = de.load()?;
        let Value::Tuple(mut items) = frame else {
            return Err(UnserializeError::Corrupt(format!(
                "expected a message tuple, got {}",
                frame.type_name()
            )));
        };
        if items.len() != 3 {
            return Err(UnserializeError::Corrupt(format!(
                "message tuple has {} items",
                items.len()
            )));
        }
        let payload = items.pop().expect("length checked");
        let id = items.pop().expect("length checked");
        let msgtype = items.pop().expect("length checked");

        let id = id
            .as_int()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| UnserializeError::Corrupt(format!("bad channel id {id:?}")))?;

        Ok(match msgtype.as_int() {
            Some(MSGTYPE_STATUS) => Self::Status { id },
            Some(MSGTYPE_CHANNEL_EXEC) => Self::ChannelExec { id, payload },
            Some(MSGTYPE_CHANNEL_DATA) => Self::ChannelData { id, payload },
            Some(MSGTYPE_CHANNEL_CLOSE) => Self::ChannelClose { id },
            Some(MSGTYPE_CHANNEL_CLOSE_ERROR) => Self::ChannelCloseError { id, payload },
            Some(MSGTYPE_CHANNEL_LAST_MESSAGE) => Self::ChannelLastMessage { id },
            Some(MSGTYPE_GATEWAY_TERMINATE) => Self::GatewayTerminate,
            _ => {
                return Err(UnserializeError::Corrupt(format!(
                    "unknown message type {msgtype:?}"
                )));
            },
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PipeReader;
    use crate::wire::deserialize::CoerceOptions;
    use crate::wire::deserialize::NoChannels;
    use crate::wire::deserialize::loads;
    use crate::wire::serialize::dumps;
    use crate::wire::value::dict_insert;

    fn decode(bytes: &[u8]) -> Message {
        let mut de = Deserializer::new(
            PipeReader::new(bytes),
            &NoChannels,
            CoerceOptions::default(),
        );
        Message::read_from(&mut de).unwrap()
    }

    #[test]
    fn data_message_roundtrips() {
        let frame = Message::ChannelData {
            id: 7,
            payload: Value::from("hello"),
        }
        .to_frame()
        .unwrap();
        match decode(&frame) {
            Message::ChannelData { id: 7, payload } => {
                assert_eq!(payload, Value::from("hello"));
            },
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn control_messages_carry_an_empty_payload() {
        let frame = Message::ChannelClose { id: 3 }.to_frame().unwrap();
        // (3, 3, "") as a tuple frame.
        assert_eq!(
            frame,
            b"G\x00\x00\x00\x03G\x00\x00\x00\x03O\x00\x00\x00\x00A\x00\x00\x00\x03R"
        );
        assert!(matches!(decode(&frame), Message::ChannelClose { id: 3 }));
    }

    #[test]
    fn terminate_roundtrips() {
        let frame = Message::GatewayTerminate.to_frame().unwrap();
        assert!(matches!(decode(&frame), Message::GatewayTerminate));
    }

    #[test]
    fn unknown_message_type_is_corruption() {
        let frame = dumps(&Value::Tuple(vec![
            Value::Int(99),
            Value::Int(0),
            Value::None,
        ]))
        .unwrap();
        let mut de = Deserializer::new(
            PipeReader::new(frame.as_slice()),
            &NoChannels,
            CoerceOptions::default(),
        );
        assert!(matches!(
            Message::read_from(&mut de),
            Err(UnserializeError::Corrupt(_))
        ));
    }

    mod roundtrip_properties {
        use proptest::prelude::*;

        use super::*;

        fn value_strategy() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::None),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::Int),
                any::<f64>().prop_map(Value::Float),
                prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
                prop::collection::vec(any::<char>(), 0..8)
                    .prop_map(|chars| Value::Str(chars.into_iter().collect())),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Tuple),
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Set),
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::FrozenSet),
                    prop::collection::vec((inner.clone(), inner), 0..4).prop_map(|pairs| {
                        let mut entries = Vec::new();
                        for (key, value) in pairs {
                            dict_insert(&mut entries, key, value);
                        }
                        Value::Dict(entries)
                    }),
                ]
            })
        }

        proptest! {
            #[test]
            fn every_value_survives_a_roundtrip(value in value_strategy()) {
                let bytes = dumps(&value).unwrap();
                let back = loads(&bytes, CoerceOptions::default()).unwrap();
                prop_assert_eq!(back, value);
            }
        }
    }
}
