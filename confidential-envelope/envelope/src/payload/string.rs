// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Payloads that are a single UTF-8 string, serialized as the raw string
//! bytes.

/// Define a payload made of one UTF-8 string.
macro_rules! utf8_payload {
    ($(#[$meta:meta])* $name:ident, $model:literal, $object_type:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, ::zeroize::Zeroize, ::zeroize::ZeroizeOnDrop)]
        pub struct $name {
            value: String,
        }

        impl $name {
            pub fn new(value: &str) -> Self {
                Self {
                    value: value.to_string(),
                }
            }

            pub fn value(&self) -> &str {
                &self.value
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("value", &"<redacted>")
                    .finish()
            }
        }

        impl $crate::payload::ConfidentialData for $name {
            const MODEL: &'static str = $model;
            const OBJECT_TYPE: &'static str = $object_type;

            fn to_bytes(&self) -> $crate::Result<::zeroize::Zeroizing<Vec<u8>>> {
                Ok(::zeroize::Zeroizing::new(self.value.as_bytes().to_vec()))
            }

            fn from_bytes(bytes: &[u8]) -> $crate::Result<Self> {
                let value = ::std::str::from_utf8(bytes).map_err(|_| {
                    $crate::Error::InvalidPayload(format!("{} payload is not UTF-8", $model))
                })?;
                Ok(Self::new(value))
            }
        }
    };
}

pub(crate) use utf8_payload;

utf8_payload!(
    /// An opaque string, e.g. a password.
    ConfidentialString,
    "string/v1",
    "string"
);

utf8_payload!(
    /// A string consumed by a generic data source rather than placed into
    /// a cloud object.
    Content,
    "general/content/v1",
    "content"
);

#[cfg(test)]
mod tests {
    use super::{ConfidentialString, Content};
    use crate::{payload::ConfidentialData, Error};

    #[test]
    fn raw_utf8_bytes() {
        let value = ConfidentialString::new("pässword");
        assert_eq!(&value.to_bytes().expect("bytes")[..], "pässword".as_bytes());
        assert_eq!(
            ConfidentialString::from_bytes("pässword".as_bytes()).expect("parse"),
            value
        );
        assert!(matches!(
            Content::from_bytes(&[0xff, 0xfe]),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn debug_does_not_print_the_value() {
        let printed = format!("{:?}", Content::new("top secret"));
        assert!(!printed.contains("top secret"));
    }
}
