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

use crate::channel::Channel;
use crate::error::UnserializeError;
use crate::transport::TransportRead;
use crate::wire::serialize::Opcode;
use crate::wire::value::Value;
use crate::wire::value::dict_insert;

/// String coercions applied while decoding, fixed per connection end.
#[derive(Debug, Clone, Copy)]
pub struct CoerceOptions {
    /// Surface legacy 8-bit strings as text (decoded as latin-1)
    /// instead of raw bytes.
    pub legacy_strings_as_text: bool,
    /// Surface text strings as raw bytes.
    pub text_as_bytes: bool,
}

impl Default for CoerceOptions {
    fn default() -> Self {
        Self {
            legacy_strings_as_text: true,
            text_as_bytes: false,
        }
    }
}

/// Looks up or creates the channel behind an inbound channel reference
/// so decoded payloads carry live handles.
pub trait ChannelResolver {
    fn resolve_channel(&self, id: u32) -> Result<Channel, UnserializeError>;
}

/// Resolver for contexts without a gateway (standalone decoding).
pub struct NoChannels;

impl ChannelResolver for NoChannels {
    fn resolve_channel(&self, id: u32) -> Result<Channel, UnserializeError> {
        Err(UnserializeError::Corrupt(format!(
            "channel reference {id} cannot be resolved without a gateway"
        )))
    }
}

/// Stack-machine decoder for the opcode stream.
///
/// Reads one opcode at a time, pushing values; SETITEM assigns into
/// the container two below the top of the stack; STOP must leave
/// exactly one value. Any malformed input is fatal to the connection.
pub struct Deserializer<'r, R: TransportRead> {
    reader: R,
    resolver: &'r dyn ChannelResolver,
    options: CoerceOptions,
}

impl<'r, R: TransportRead> Deserializer<'r, R> {
    pub fn new(reader: R, resolver: &'r dyn ChannelResolver, options: CoerceOptions) -> Self {
        Self {
            reader,
            resolver,
            options,
        }
    }

    pub fn into_reader(self) -> R {
        self.reader
    }

    /// Decodes one complete value (one frame).
    pub fn load(&mut self) -> Result<Value, UnserializeError> {
        let mut stack: Vec<Value> = Vec::new();
        loop {
            let byte = self.read_u8()?;
            let opcode = Opcode::from_byte(byte).ok_or_else(|| {
                UnserializeError::Corrupt(format!("unknown opcode {:#04x}", byte))
            })?;
            match opcode {
                Opcode::Stop => break,
                Opcode::None => stack.push(Value::None),
                Opcode::True => stack.push(Value::Bool(true)),
                Opcode::False => stack.push(Value::Bool(false)),
                Opcode::Int | Opcode::Long => {
                    let i = self.read_i32()?;
                    stack.push(Value::Int(i64::from(i)));
                },
                Opcode::LongInt | Opcode::LongLong => {
                    let digits = self.read_byte_sequence()?;
                    let text = std::str::from_utf8(&digits).map_err(|_| {
                        UnserializeError::Corrupt("non-ascii integer literal".into())
                    })?;
                    let i: i64 = text.parse().map_err(|_| {
                        UnserializeError::Corrupt(format!("integer literal {text:?} out of range"))
                    })?;
                    stack.push(Value::Int(i));
                },
                Opcode::Float => {
                    let mut buf = [0u8; 8];
                    self.reader.read_exact(&mut buf)?;
                    stack.push(Value::Float(f64::from_bits(u64::from_be_bytes(buf))));
                },
                Opcode::Bytes => {
                    let bytes = self.read_byte_sequence()?;
                    stack.push(Value::Bytes(bytes));
                },
                Opcode::Py3String => {
                    let bytes = self.read_byte_sequence()?;
                    if self.options.text_as_bytes {
                        stack.push(Value::Bytes(bytes));
                    } else {
                        stack.push(Value::Str(decode_utf8(bytes)?));
                    }
                },
                Opcode::Py2String => {
                    let bytes = self.read_byte_sequence()?;
                    if self.options.legacy_strings_as_text {
                        // Legacy strings carry arbitrary octets; latin-1
                        // maps each one to the same code point.
                        stack.push(Value::Str(bytes.iter().map(|&b| b as char).collect()));
                    } else {
                        stack.push(Value::Bytes(bytes));
                    }
                },
                Opcode::Unicode => {
                    let bytes = self.read_byte_sequence()?;
                    stack.push(Value::Str(decode_utf8(bytes)?));
                },
                Opcode::NewList => {
                    let len = self.read_len()?;
                    stack.push(Value::List(vec![Value::None; len]));
                },
                Opcode::NewDict => stack.push(Value::Dict(Vec::new())),
                Opcode::SetItem => {
                    if stack.len() < 3 {
                        return Err(UnserializeError::Corrupt(
                            "not enough items on the stack for setitem".into(),
                        ));
                    }
                    let value = stack.pop().expect("stack length checked");
                    let key = stack.pop().expect("stack length checked");
                    match stack.last_mut().expect("stack length checked") {
                        Value::List(items) => {
                            let index = key
                                .as_int()
                                .and_then(|i| usize::try_from(i).ok())
                                .filter(|&i| i < items.len())
                                .ok_or_else(|| {
                                    UnserializeError::Corrupt(format!(
                                        "setitem index {key:?} out of bounds"
                                    ))
                                })?;
                            items[index] = value;
                        },
                        Value::Dict(entries) => dict_insert(entries, key, value),
                        other => {
                            return Err(UnserializeError::Corrupt(format!(
                                "setitem into a {}",
                                other.type_name()
                            )));
                        },
                    }
                },
                Opcode::BuildTuple => {
                    let items = self.pop_sequence(&mut stack)?;
                    stack.push(Value::Tuple(items));
                },
                Opcode::Set => {
                    let items = self.pop_sequence(&mut stack)?;
                    stack.push(Value::Set(items));
                },
                Opcode::FrozenSet => {
                    let items = self.pop_sequence(&mut stack)?;
                    stack.push(Value::FrozenSet(items));
                },
                Opcode::Channel => {
                    let id = self.read_len()? as u32;
                    stack.push(Value::Channel(self.resolver.resolve_channel(id)?));
                },
            }
        }
        if stack.len() != 1 {
            return Err(UnserializeError::Corrupt(
                "internal unserialization error".into(),
            ));
        }
        Ok(stack.pop().expect("stack length checked"))
    }

    fn pop_sequence(&mut self, stack: &mut Vec<Value>) -> Result<Vec<Value>, UnserializeError> {
        let len = self.read_len()?;
        if stack.len() < len {
            return Err(UnserializeError::Corrupt(format!(
                "sequence of {len} items with only {} on the stack",
                stack.len()
            )));
        }
        Ok(stack.split_off(stack.len() - len))
    }

    fn read_u8(&mut self) -> Result<u8, UnserializeError> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_i32(&mut self) -> Result<i32, UnserializeError> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    fn read_len(&mut self) -> Result<usize, UnserializeError> {
        let i = self.read_i32()?;
        usize::try_from(i)
            .map_err(|_| UnserializeError::Corrupt(format!("negative length field {i}")))
    }

    fn read_byte_sequence(&mut self) -> Result<Vec<u8>, UnserializeError> {
        let len = self.read_len()?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn decode_utf8(bytes: Vec<u8>) -> Result<String, UnserializeError> {
    String::from_utf8(bytes)
        .map_err(|_| UnserializeError::Corrupt("text string is not valid utf-8".into()))
}

/// Decodes one self-contained frame that holds no channel references.
pub fn loads(bytes: &[u8], options: CoerceOptions) -> Result<Value, UnserializeError> {
    use crate::transport::PipeReader;

    Deserializer::new(PipeReader::new(bytes), &NoChannels, options).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::serialize::dumps;

    fn roundtrip(value: Value) {
        let bytes = dumps(&value).unwrap();
        let back = loads(&bytes, CoerceOptions::default()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn scalars_roundtrip() {
        roundtrip(Value::None);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(i64::from(i32::MAX)));
        roundtrip(Value::Int(i64::from(i32::MIN)));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Float(3.25));
        roundtrip(Value::Float(f64::NAN));
        roundtrip(Value::Bytes(vec![0, 1, 2, 255]));
        roundtrip(Value::Str("snowman \u{2603}".into()));
    }

    #[test]
    fn containers_roundtrip() {
        roundtrip(Value::List(vec![
            Value::Int(1),
            Value::Str("two".into()),
            Value::List(vec![Value::None]),
        ]));
        roundtrip(Value::Tuple(vec![]));
        roundtrip(Value::Tuple(vec![
            Value::Int(1),
            Value::Tuple(vec![Value::Int(2)]),
        ]));
        roundtrip(Value::Set(vec![Value::Int(1), Value::Int(2)]));
        roundtrip(Value::FrozenSet(vec![Value::Str("a".into())]));
        roundtrip(Value::Dict(vec![
            (Value::from("k"), Value::from(1)),
            (Value::from(2), Value::List(vec![Value::Bool(false)])),
        ]));
    }

    #[test]
    fn legacy_strings_decode_as_latin1_text_by_default() {
        // PY2STRING with bytes 0x68 0xe9 ("h" + e-acute in latin-1).
        let frame = b"N\x00\x00\x00\x02h\xe9R";
        let value = loads(frame, CoerceOptions::default()).unwrap();
        assert_eq!(value, Value::Str("h\u{e9}".into()));

        let value = loads(
            frame,
            CoerceOptions {
                legacy_strings_as_text: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(value, Value::Bytes(vec![0x68, 0xe9]));
    }

    #[test]
    fn text_as_bytes_coercion() {
        let frame = dumps(&Value::Str("hi".into())).unwrap();
        let value = loads(
            &frame,
            CoerceOptions {
                text_as_bytes: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(value, Value::Bytes(b"hi".to_vec()));
    }

    #[test]
    fn alternate_unicode_tag_decodes_as_text() {
        let frame = b"T\x00\x00\x00\x02hiR";
        let value = loads(frame, CoerceOptions::default()).unwrap();
        assert_eq!(value, Value::Str("hi".into()));
    }

    #[test]
    fn long_aliases_decode_like_their_plain_forms() {
        assert_eq!(
            loads(b"H\x00\x00\x00\x2aR", CoerceOptions::default()).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            loads(b"J\x00\x00\x00\x0242R", CoerceOptions::default()).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn unknown_opcode_is_corruption() {
        let err = loads(b"zR", CoerceOptions::default()).unwrap_err();
        assert!(matches!(err, UnserializeError::Corrupt(_)));
    }

    #[test]
    fn truncated_stream_is_eof() {
        let frame = dumps(&Value::Str("hello".into())).unwrap();
        let err = loads(&frame[..3], CoerceOptions::default()).unwrap_err();
        assert!(matches!(err, UnserializeError::Eof));
        let err = loads(b"", CoerceOptions::default()).unwrap_err();
        assert!(matches!(err, UnserializeError::Eof));
    }

    #[test]
    fn missing_stop_with_leftover_stack_is_corruption() {
        // Two ints and a STOP: one value too many on the stack.
        let err = loads(
            b"G\x00\x00\x00\x01G\x00\x00\x00\x02R",
            CoerceOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, UnserializeError::Corrupt(_)));
    }

    #[test]
    fn channel_reference_needs_a_gateway() {
        let err = loads(b"C\x00\x00\x00\x05R", CoerceOptions::default()).unwrap_err();
        assert!(matches!(err, UnserializeError::Corrupt(_)));
    }

    #[test]
    fn overlong_integer_literal_is_corruption() {
        let err = loads(
            b"I\x00\x00\x00\x1499999999999999999999R",
            CoerceOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, UnserializeError::Corrupt(_)));
    }
}
