//! The one-byte status taxonomy of the wire protocol.
//!
//! The top two bits partition the space: `00` requests, `01` good
//! responses, `10` bad responses, `11` reserved. Request sub-bits encode
//! which body fields are present.

const CLASS_MASK: u8 = 0xC0;
const CLASS_REQUEST: u8 = 0x00;
const CLASS_GOOD: u8 = 0x40;
const CLASS_BAD: u8 = 0x80;

const REQUEST_METHOD_BIT: u8 = 0x01;
const REQUEST_PAYLOAD_BIT: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Request = 0x00,
    RequestWithMethod = 0x01,
    RequestWithPayload = 0x02,
    RequestWithMethodAndPayload = 0x03,
    Ok = 0x40,
    OkWithPayload = 0x41,
    Error = 0x80,
    UnrecognizedProtocol = 0x81,
    IncompleteData = 0x82,
    InvalidStatusCode = 0x83,
    InvalidBody = 0x84,
    BufferOverflow = 0x85,
    FailedRequestHandling = 0x86,
}

impl StatusCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let code = match byte {
            0x00 => Self::Request,
            0x01 => Self::RequestWithMethod,
            0x02 => Self::RequestWithPayload,
            0x03 => Self::RequestWithMethodAndPayload,
            0x40 => Self::Ok,
            0x41 => Self::OkWithPayload,
            0x80 => Self::Error,
            0x81 => Self::UnrecognizedProtocol,
            0x82 => Self::IncompleteData,
            0x83 => Self::InvalidStatusCode,
            0x84 => Self::InvalidBody,
            0x85 => Self::BufferOverflow,
            0x86 => Self::FailedRequestHandling,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// The request code announcing the given body fields.
    pub fn request(has_method: bool, has_payload: bool) -> Self {
        let byte = CLASS_REQUEST
            | if has_method { REQUEST_METHOD_BIT } else { 0 }
            | if has_payload { REQUEST_PAYLOAD_BIT } else { 0 };
        Self::from_byte(byte).expect("request codes are always recognized")
    }

    pub fn is_request(self) -> bool {
        self.as_byte() & CLASS_MASK == CLASS_REQUEST
    }

    pub fn is_good(self) -> bool {
        self.as_byte() & CLASS_MASK == CLASS_GOOD
    }

    pub fn is_bad(self) -> bool {
        self.as_byte() & CLASS_MASK == CLASS_BAD
    }

    pub fn has_method(self) -> bool {
        self.is_request() && self.as_byte() & REQUEST_METHOD_BIT != 0
    }

    pub fn has_payload(self) -> bool {
        match self {
            Self::OkWithPayload => true,
            _ => self.is_request() && self.as_byte() & REQUEST_PAYLOAD_BIT != 0,
        }
    }

    /// Wire `message` carried by bad responses.
    pub fn text_message(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::UnrecognizedProtocol => "unrecognized protocol",
            Self::IncompleteData => "incomplete data",
            Self::InvalidStatusCode => "invalid status code",
            Self::InvalidBody => "invalid body",
            Self::BufferOverflow => "buffer overflow",
            Self::FailedRequestHandling => "failed request handling",
            _ => "",
        }
    }

    pub fn all() -> &'static [StatusCode] {
        &[
            Self::Request,
            Self::RequestWithMethod,
            Self::RequestWithPayload,
            Self::RequestWithMethodAndPayload,
            Self::Ok,
            Self::OkWithPayload,
            Self::Error,
            Self::UnrecognizedProtocol,
            Self::IncompleteData,
            Self::InvalidStatusCode,
            Self::InvalidBody,
            Self::BufferOverflow,
            Self::FailedRequestHandling,
        ]
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::StatusCode;

    #[test]
    fn test_byte_round_trip() {
        for &code in StatusCode::all() {
            assert_eq!(StatusCode::from_byte(code.as_byte()), Some(code));
        }
    }

    #[test]
    fn test_request_bits() {
        assert_eq!(StatusCode::request(false, false), StatusCode::Request);
        assert_eq!(StatusCode::request(true, false), StatusCode::RequestWithMethod);
        assert_eq!(StatusCode::request(false, true), StatusCode::RequestWithPayload);
        assert_eq!(
            StatusCode::request(true, true),
            StatusCode::RequestWithMethodAndPayload
        );
        assert!(StatusCode::RequestWithMethodAndPayload.has_method());
        assert!(!StatusCode::RequestWithMethod.has_payload());
        assert!(StatusCode::OkWithPayload.has_payload());
        assert!(!StatusCode::Ok.has_payload());
    }

    proptest! {
        // Recognized codes land in exactly one class; reserved bytes are
        // rejected outright.
        #[test]
        fn proptest_class_partition(byte: u8) {
            match StatusCode::from_byte(byte) {
                Some(code) => {
                    let classes =
                        [code.is_request(), code.is_good(), code.is_bad()];
                    prop_assert_eq!(classes.iter().filter(|&&c| c).count(), 1);
                },
                None => {
                    // Reserved: either the 11 class or an unassigned
                    // sub-code.
                },
            }
        }
    }

    #[test]
    fn test_reserved_class_rejected() {
        for byte in 0xC0..=0xFF {
            assert_eq!(StatusCode::from_byte(byte), None);
        }
    }
}
