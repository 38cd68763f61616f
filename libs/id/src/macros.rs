//! Macros for defining typed ID types.

/// Macro to define a typed, opaque string ID.
///
/// This generates a newtype wrapper around `String` with:
/// - `new()` to generate a fresh random ID (UUID v4 text form)
/// - `parse()` to validate and wrap an existing string
/// - `as_str()` for borrowing the raw value
/// - `Display`, `FromStr`, `AsRef<str>` and `Borrow<str>` implementations
/// - `Serialize` and `Deserialize` implementations (plain JSON strings)
///
/// # Example
///
/// ```ignore
/// define_id!(NodeId);
///
/// let node: NodeId = "5456bd7a-9fc0-c0dd-6131-cbee77f57577".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID from a random UUID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4().to_string())
            }

            /// Parses an ID from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate(s)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the raw ID string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the ID and returns the raw string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
