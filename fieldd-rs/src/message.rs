/* The smart sensor message family.
 *
 * Every message is a one-byte type code, a one-byte payload length and
 * a variable payload. Parameter sets travel as 16-bit masks (bit i =
 * parameter index i); `DeviceWrite` and `DeviceData` append the values
 * little-endian in ascending index order with no padding. */

use crate::codec::{self, RawFrame};
use crate::error::RuntimeError;
use crate::schema::{DeviceType, Uid, Value};

/* Message type codes. */
pub const MSG_PING: u8 = 0x10;
pub const MSG_SUBSCRIPTION_REQUEST: u8 = 0x11;
pub const MSG_SUBSCRIPTION_RESPONSE: u8 = 0x12;
pub const MSG_DEVICE_READ: u8 = 0x13;
pub const MSG_DEVICE_WRITE: u8 = 0x14;
pub const MSG_DEVICE_DATA: u8 = 0x15;
pub const MSG_DISABLE: u8 = 0x16;
pub const MSG_HEARTBEAT_REQUEST: u8 = 0x17;
pub const MSG_HEARTBEAT_RESPONSE: u8 = 0x18;
pub const MSG_ERROR: u8 = 0xff;

/* Device-reported error codes. */
pub const ERR_UNEXPECTED_DELIMITER: u8 = 0xfd;
pub const ERR_CHECKSUM: u8 = 0xfe;
pub const ERR_GENERIC: u8 = 0xff;

/* The SubscriptionResponse payload is fixed:
 * mask u16 | delay u16 | dev_type u16 | year u8 | serial u64. */
const SUBSCRIPTION_RESPONSE_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    SubscriptionRequest {
        params: u16,
        delay: u16,
    },
    SubscriptionResponse {
        params: u16,
        delay: u16,
        uid: Uid,
    },
    DeviceRead {
        params: u16,
    },
    /* Values carry their own types; the caller packs them against the
     * device type with `pack_params`. */
    DeviceWrite {
        params: u16,
        data: Vec<u8>,
    },
    DeviceData {
        params: u16,
        data: Vec<u8>,
    },
    Disable,
    HeartBeatRequest {
        id: u8,
    },
    HeartBeatResponse {
        id: u8,
    },
    Error {
        code: u8,
    },
}

impl Message {
    pub fn message_id(&self) -> u8 {
        match self {
            Message::Ping => MSG_PING,
            Message::SubscriptionRequest { .. } => MSG_SUBSCRIPTION_REQUEST,
            Message::SubscriptionResponse { .. } => MSG_SUBSCRIPTION_RESPONSE,
            Message::DeviceRead { .. } => MSG_DEVICE_READ,
            Message::DeviceWrite { .. } => MSG_DEVICE_WRITE,
            Message::DeviceData { .. } => MSG_DEVICE_DATA,
            Message::Disable => MSG_DISABLE,
            Message::HeartBeatRequest { .. } => MSG_HEARTBEAT_REQUEST,
            Message::HeartBeatResponse { .. } => MSG_HEARTBEAT_RESPONSE,
            Message::Error { .. } => MSG_ERROR,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::Ping | Message::Disable => Vec::new(),
            Message::SubscriptionRequest { params, delay } => {
                let mut payload = Vec::with_capacity(4);
                payload.extend_from_slice(&params.to_le_bytes());
                payload.extend_from_slice(&delay.to_le_bytes());
                payload
            }
            Message::SubscriptionResponse { params, delay, uid } => {
                let mut payload = Vec::with_capacity(SUBSCRIPTION_RESPONSE_LEN);
                payload.extend_from_slice(&params.to_le_bytes());
                payload.extend_from_slice(&delay.to_le_bytes());
                payload.extend_from_slice(&uid.device_type().to_le_bytes());
                payload.push(uid.year());
                payload.extend_from_slice(&uid.serial().to_le_bytes());
                payload
            }
            Message::DeviceRead { params } => params.to_le_bytes().to_vec(),
            Message::DeviceWrite { params, data } | Message::DeviceData { params, data } => {
                let mut payload = Vec::with_capacity(2 + data.len());
                payload.extend_from_slice(&params.to_le_bytes());
                payload.extend_from_slice(data);
                payload
            }
            Message::HeartBeatRequest { id } | Message::HeartBeatResponse { id } => vec![*id],
            Message::Error { code } => vec![*code],
        }
    }

    /* Serialize to a complete wire frame. */
    pub fn to_frame(&self) -> Result<Vec<u8>, RuntimeError> {
        codec::encode_frame(self.message_id(), &self.payload())
    }

    /* Interpret a decoded frame. `DeviceWrite`/`DeviceData` values are
     * kept raw here; decode them against a device type with
     * `unpack_params`. */
    pub fn parse(frame: &RawFrame) -> Result<Message, RuntimeError> {
        let payload = &frame.payload;
        match frame.message_id {
            MSG_PING => Ok(Message::Ping),
            MSG_DISABLE => Ok(Message::Disable),
            MSG_SUBSCRIPTION_REQUEST => {
                if payload.len() != 4 {
                    return Err(RuntimeError::violation(
                        frame.message_id,
                        "subscription request payload must be 4 bytes",
                    ));
                }
                Ok(Message::SubscriptionRequest {
                    params: u16::from_le_bytes([payload[0], payload[1]]),
                    delay: u16::from_le_bytes([payload[2], payload[3]]),
                })
            }
            MSG_SUBSCRIPTION_RESPONSE => {
                if payload.len() != SUBSCRIPTION_RESPONSE_LEN {
                    return Err(RuntimeError::violation(
                        frame.message_id,
                        format!(
                            "subscription response payload must be {SUBSCRIPTION_RESPONSE_LEN} \
                             bytes, got {}",
                            payload.len()
                        ),
                    ));
                }
                let device_type = u16::from_le_bytes([payload[4], payload[5]]);
                let year = payload[6];
                let mut serial_bytes = [0u8; 8];
                serial_bytes.copy_from_slice(&payload[7..15]);
                let serial = u64::from_le_bytes(serial_bytes);
                Ok(Message::SubscriptionResponse {
                    params: u16::from_le_bytes([payload[0], payload[1]]),
                    delay: u16::from_le_bytes([payload[2], payload[3]]),
                    uid: Uid::new(device_type, year, serial),
                })
            }
            MSG_DEVICE_READ => {
                if payload.len() != 2 {
                    return Err(RuntimeError::violation(
                        frame.message_id,
                        "device read payload must be 2 bytes",
                    ));
                }
                Ok(Message::DeviceRead {
                    params: u16::from_le_bytes([payload[0], payload[1]]),
                })
            }
            MSG_DEVICE_WRITE | MSG_DEVICE_DATA => {
                if payload.len() < 2 {
                    return Err(RuntimeError::violation(
                        frame.message_id,
                        "missing parameter mask",
                    ));
                }
                let params = u16::from_le_bytes([payload[0], payload[1]]);
                let data = payload[2..].to_vec();
                if frame.message_id == MSG_DEVICE_WRITE {
                    Ok(Message::DeviceWrite { params, data })
                } else {
                    Ok(Message::DeviceData { params, data })
                }
            }
            MSG_HEARTBEAT_REQUEST => Ok(Message::HeartBeatRequest {
                id: payload.first().copied().unwrap_or(0),
            }),
            MSG_HEARTBEAT_RESPONSE => Ok(Message::HeartBeatResponse {
                id: payload.first().copied().unwrap_or(0),
            }),
            MSG_ERROR => Ok(Message::Error {
                code: payload.first().copied().unwrap_or(ERR_GENERIC),
            }),
            other => Err(RuntimeError::violation(other, "unknown message type")),
        }
    }
}

/* Pack `(index, value)` pairs into a bitmask and value bytes. Input
 * order does not matter; output values are sorted by index so the
 * receiver can walk the mask bits in ascending order. */
pub fn pack_params(values: &[(usize, Value)]) -> (u16, Vec<u8>) {
    let mut sorted: Vec<&(usize, Value)> = values.iter().collect();
    sorted.sort_by_key(|(index, _)| *index);

    let mut mask = 0u16;
    let mut data = Vec::new();
    for (index, value) in sorted {
        mask |= 1 << index;
        value.encode_to(&mut data);
    }
    (mask, data)
}

/* Decode the value bytes of a `DeviceWrite`/`DeviceData` payload
 * against the device type. Leftover or missing bytes are a protocol
 * violation. */
pub fn unpack_params(
    device: &DeviceType,
    mask: u16,
    data: &[u8],
) -> Result<Vec<(usize, Value)>, RuntimeError> {
    let mut values = Vec::new();
    let mut cursor = data;
    for index in device.decode_params(mask) {
        let scalar = device.params[index].scalar_type;
        let value = scalar.decode(cursor).ok_or_else(|| {
            RuntimeError::violation(MSG_DEVICE_DATA, "value bytes shorter than the mask demands")
        })?;
        cursor = &cursor[scalar.size()..];
        values.push((index, value));
    }
    if !cursor.is_empty() {
        return Err(RuntimeError::violation(
            MSG_DEVICE_DATA,
            "trailing bytes after the last masked parameter",
        ));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameScanner;
    use crate::schema::tests::test_schema;

    fn roundtrip(message: Message) -> Message {
        let frame = message.to_frame().unwrap();
        let mut scanner = FrameScanner::new();
        scanner.extend(&frame);
        let raw = scanner.next_frame().unwrap().unwrap();
        Message::parse(&raw).unwrap()
    }

    #[test]
    fn test_roundtrip_control_messages() {
        assert_eq!(roundtrip(Message::Ping), Message::Ping);
        assert_eq!(roundtrip(Message::Disable), Message::Disable);
        assert_eq!(
            roundtrip(Message::HeartBeatRequest { id: 7 }),
            Message::HeartBeatRequest { id: 7 }
        );
        assert_eq!(
            roundtrip(Message::HeartBeatResponse { id: 7 }),
            Message::HeartBeatResponse { id: 7 }
        );
        assert_eq!(
            roundtrip(Message::Error { code: ERR_CHECKSUM }),
            Message::Error { code: ERR_CHECKSUM }
        );
    }

    #[test]
    fn test_roundtrip_subscription() {
        let message = Message::SubscriptionRequest {
            params: 0b101,
            delay: 40,
        };
        assert_eq!(roundtrip(message.clone()), message);

        let uid = Uid::new(0x000d, 0x00, 0x0123_4567_89ab_cdef);
        let message = Message::SubscriptionResponse {
            params: 0,
            delay: 0,
            uid,
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_subscription_response_length_enforced() {
        let raw = RawFrame {
            message_id: MSG_SUBSCRIPTION_RESPONSE,
            payload: vec![0; 14],
        };
        assert!(matches!(
            Message::parse(&raw),
            Err(RuntimeError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_pack_sorts_by_index() {
        let (mask, data) = pack_params(&[(2, Value::Bool(true)), (0, Value::F32(0.5))]);
        assert_eq!(mask, 0b101);
        /* duty_cycle first (index 0), then the bool at index 2. */
        assert_eq!(data, vec![0x00, 0x00, 0x00, 0x3f, 0x01]);
    }

    #[test]
    fn test_pack_unpack_every_scalar() {
        let schema = test_schema();
        let yogi = schema.get(13).unwrap();
        let values = vec![
            (0, Value::F32(-0.75)),
            (1, Value::F64(1234.5)),
            (2, Value::Bool(true)),
        ];
        let (mask, data) = pack_params(&values);
        assert_eq!(unpack_params(&yogi, mask, &data).unwrap(), values);
    }

    #[test]
    fn test_unpack_rejects_short_data() {
        let schema = test_schema();
        let yogi = schema.get(13).unwrap();
        assert!(matches!(
            unpack_params(&yogi, 0b001, &[0x00, 0x00]),
            Err(RuntimeError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_unpack_rejects_trailing_data() {
        let schema = test_schema();
        let yogi = schema.get(13).unwrap();
        assert!(matches!(
            unpack_params(&yogi, 0b100, &[0x01, 0xff]),
            Err(RuntimeError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_device_write_wire_layout() {
        /* duty_cycle = 0.5 on a YogiBear: mask 0x0001, value bytes
         * 00 00 00 3f. */
        let (mask, data) = pack_params(&[(0, Value::F32(0.5))]);
        let frame = Message::DeviceWrite { params: mask, data }.to_frame().unwrap();
        let mut scanner = FrameScanner::new();
        scanner.extend(&frame);
        let raw = scanner.next_frame().unwrap().unwrap();
        assert_eq!(raw.message_id, MSG_DEVICE_WRITE);
        assert_eq!(raw.payload, vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x3f]);
    }
}
