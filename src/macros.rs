//! Declarative generators for the protocol enum tables.

/// Generates the wire frame-type enum with `from_u32` lookup.
#[macro_export]
macro_rules! define_frame_type {
    ( $( $name:ident = $value:expr ),+ $(,)? ) => {
        /// Tuya frame type (the `cmd` header field).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum FrameType {
            $( $name = $value, )+
        }

        impl FrameType {
            /// Look up a frame type from the raw `cmd` field.
            pub fn from_u32(value: u32) -> Option<Self> {
                $(
                    if value == $value {
                        return Some(FrameType::$name);
                    }
                )+
                None
            }
        }

        impl std::fmt::Display for FrameType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $( FrameType::$name => f.write_str(stringify!($name)), )+
                }
            }
        }
    };
}

/// Generates the protocol version enum with string/code conversions.
#[macro_export]
macro_rules! define_protocol_version {
    ( $( $name:ident = ($text:expr, $code:expr) ),+ $(,)? ) => {
        /// Tuya LAN protocol dialect.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $( $name, )+
        }

        impl Version {
            /// Dotted form as it appears in the cleartext payload header ("3.3").
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Version::$name => $text, )+
                }
            }

            /// The 3 ASCII bytes of the dotted form.
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }

            /// Two-digit configuration code (31, 33, 34).
            pub fn code(&self) -> u8 {
                match self {
                    $( Version::$name => $code, )+
                }
            }

            /// Look up a version from its configuration code.
            pub fn from_code(code: u8) -> Option<Self> {
                $(
                    if code == $code {
                        return Some(Version::$name);
                    }
                )+
                None
            }
        }

        impl std::str::FromStr for Version {
            type Err = ();

            /// Accepts both the dotted form ("3.4") and the bare code ("34").
            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $(
                    if s == $text || s == stringify!($code) {
                        return Ok(Version::$name);
                    }
                )+
                Err(())
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
