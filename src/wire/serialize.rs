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

use crate::error::SerializeError;
use crate::wire::value::Value;

/// Largest integer representable in the wire's 4-byte signed fields.
pub(crate) const WIRE_INT_MAX: i64 = 2_147_483_647;

/// Single-byte wire opcodes.
///
/// The letters are assigned in alphabetical order of the opcode names,
/// which keeps the byte values stable across implementations and
/// language versions. Never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    BuildTuple = b'A',
    Bytes = b'B',
    Channel = b'C',
    False = b'D',
    Float = b'E',
    FrozenSet = b'F',
    Int = b'G',
    Long = b'H',
    LongInt = b'I',
    LongLong = b'J',
    NewDict = b'K',
    NewList = b'L',
    None = b'M',
    Py2String = b'N',
    Py3String = b'O',
    Set = b'P',
    SetItem = b'Q',
    Stop = b'R',
    True = b'S',
    Unicode = b'T',
}

impl Opcode {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'A' => Self::BuildTuple,
            b'B' => Self::Bytes,
            b'C' => Self::Channel,
            b'D' => Self::False,
            b'E' => Self::Float,
            b'F' => Self::FrozenSet,
            b'G' => Self::Int,
            b'H' => Self::Long,
            b'I' => Self::LongInt,
            b'J' => Self::LongLong,
            b'K' => Self::NewDict,
            b'L' => Self::NewList,
            b'M' => Self::None,
            b'N' => Self::Py2String,
            b'O' => Self::Py3String,
            b'P' => Self::Set,
            b'Q' => Self::SetItem,
            b'R' => Self::Stop,
            b'S' => Self::True,
            b'T' => Self::Unicode,
            _ => return Option::None,
        })
    }
}

/// Push serializer for one value.
///
/// The whole frame is built in a local buffer and only handed out once
/// encoding succeeded, so a failing `save` never leaves half a message
/// behind and one buffer maps to one transport write.
pub struct Serializer {
    out: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { out: Vec::new() }
    }

    /// Encodes `value` followed by STOP and returns the frame bytes.
    pub fn save(mut self, value: &Value) -> Result<Vec<u8>, SerializeError> {
        self.put(value)?;
        self.op(Opcode::Stop);
        Ok(self.out)
    }

    /// Encodes a message frame `(msgtype, channel id, payload)` as one
    /// tuple without taking ownership of the payload.
    pub(crate) fn save_message(
        mut self,
        msgtype: i64,
        channel_id: u32,
        payload: &Value,
    ) -> Result<Vec<u8>, SerializeError> {
        self.put_int(msgtype)?;
        self.put_int(i64::from(channel_id))?;
        self.put(payload)?;
        self.op(Opcode::BuildTuple);
        self.put_len(3, "tuple")?;
        self.op(Opcode::Stop);
        Ok(self.out)
    }

    fn op(&mut self, opcode: Opcode) {
        self.out.push(opcode as u8);
    }

    fn put(&mut self, value: &Value) -> Result<(), SerializeError> {
        match value {
            Value::None => self.op(Opcode::None),
            Value::Bool(true) => self.op(Opcode::True),
            Value::Bool(false) => self.op(Opcode::False),
            Value::Int(i) => self.put_int(*i)?,
            Value::Float(f) => {
                self.op(Opcode::Float);
                self.out.extend_from_slice(&f.to_bits().to_be_bytes());
            },
            Value::Bytes(bytes) => {
                self.op(Opcode::Bytes);
                self.put_byte_sequence(bytes)?;
            },
            Value::Str(s) => {
                self.op(Opcode::Py3String);
                self.put_byte_sequence(s.as_bytes())?;
            },
            Value::List(items) => {
                self.op(Opcode::NewList);
                self.put_len(items.len(), "list")?;
                for (index, item) in items.iter().enumerate() {
                    self.put_int(index as i64)?;
                    self.put(item)?;
                    self.op(Opcode::SetItem);
                }
            },
            Value::Dict(entries) => {
                self.op(Opcode::NewDict);
                for (key, val) in entries {
                    self.put(key)?;
                    self.put(val)?;
                    self.op(Opcode::SetItem);
                }
            },
            Value::Tuple(items) => {
                for item in items {
                    self.put(item)?;
                }
                self.op(Opcode::BuildTuple);
                self.put_len(items.len(), "tuple")?;
            },
            Value::Set(items) => {
                for item in items {
                    self.put(item)?;
                }
                self.op(Opcode::Set);
                self.put_len(items.len(), "set")?;
            },
            Value::FrozenSet(items) => {
                for item in items {
                    self.put(item)?;
                }
                self.op(Opcode::FrozenSet);
                self.put_len(items.len(), "frozenset")?;
            },
            Value::Channel(channel) => {
                self.op(Opcode::Channel);
                self.put_len(channel.id() as usize, "channel id")?;
            },
        }
        Ok(())
    }

    fn put_int(&mut self, i: i64) -> Result<(), SerializeError> {
        match i32::try_from(i) {
            Ok(small) => {
                self.op(Opcode::Int);
                self.out.extend_from_slice(&small.to_be_bytes());
            },
            Err(_) => {
                self.op(Opcode::LongInt);
                self.put_byte_sequence(i.to_string().as_bytes())?;
            },
        }
        Ok(())
    }

    fn put_byte_sequence(&mut self, bytes: &[u8]) -> Result<(), SerializeError> {
        self.put_len(bytes.len(), "byte sequence")?;
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn put_len(&mut self, len: usize, what: &'static str) -> Result<(), SerializeError> {
        if len as u128 > WIRE_INT_MAX as u128 {
            return Err(SerializeError::TooLong { what, len });
        }
        self.out.extend_from_slice(&(len as i32).to_be_bytes());
        Ok(())
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes one value into a self-contained frame.
pub fn dumps(value: &Value) -> Result<Vec<u8>, SerializeError> {
    Serializer::new().save(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_letters_follow_alphabetical_names() {
        // The wire contract: A..T in alphabetical opcode-name order.
        assert_eq!(Opcode::BuildTuple as u8, b'A');
        assert_eq!(Opcode::Channel as u8, b'C');
        assert_eq!(Opcode::Int as u8, b'G');
        assert_eq!(Opcode::LongInt as u8, b'I');
        assert_eq!(Opcode::NewList as u8, b'L');
        assert_eq!(Opcode::Py3String as u8, b'O');
        assert_eq!(Opcode::SetItem as u8, b'Q');
        assert_eq!(Opcode::Stop as u8, b'R');
        assert_eq!(Opcode::Unicode as u8, b'T');
    }

    #[test]
    fn scalar_frames_match_the_wire_layout() {
        assert_eq!(dumps(&Value::None).unwrap(), b"MR");
        assert_eq!(dumps(&Value::Bool(true)).unwrap(), b"SR");
        assert_eq!(dumps(&Value::Bool(false)).unwrap(), b"DR");
        assert_eq!(dumps(&Value::Int(1)).unwrap(), b"G\x00\x00\x00\x01R");
        assert_eq!(
            dumps(&Value::Int(-1)).unwrap(),
            b"G\xff\xff\xff\xffR".to_vec()
        );
        assert_eq!(
            dumps(&Value::Str("hi".into())).unwrap(),
            b"O\x00\x00\x00\x02hiR"
        );
    }

    #[test]
    fn ints_beyond_32_bits_travel_as_decimal_text() {
        let frame = dumps(&Value::Int(5_000_000_000)).unwrap();
        assert_eq!(frame[0], b'I');
        assert_eq!(&frame[1..5], &10i32.to_be_bytes());
        assert_eq!(&frame[5..15], b"5000000000");
        assert_eq!(frame[15], b'R');

        let frame = dumps(&Value::Int(i64::MIN)).unwrap();
        assert_eq!(frame[0], b'I');
    }

    #[test]
    fn tuple_frame_layout() {
        let value = Value::Tuple(vec![Value::Int(0), Value::Int(1), Value::Str(String::new())]);
        assert_eq!(
            dumps(&value).unwrap(),
            b"G\x00\x00\x00\x00G\x00\x00\x00\x01O\x00\x00\x00\x00A\x00\x00\x00\x03R"
        );
    }

    #[test]
    fn list_items_are_indexed_assignments() {
        let value = Value::List(vec![Value::Int(7)]);
        assert_eq!(
            dumps(&value).unwrap(),
            b"L\x00\x00\x00\x01G\x00\x00\x00\x00G\x00\x00\x00\x07QR"
        );
    }

    #[test]
    fn float_is_big_endian_ieee754() {
        let frame = dumps(&Value::Float(1.5)).unwrap();
        assert_eq!(frame[0], b'E');
        assert_eq!(&frame[1..9], &1.5f64.to_bits().to_be_bytes());
    }
}
