// src/core/commands/command_def.rs

//! The macro that generates `CommandBody` and its conversions.

/// Expands a table of `(Variant, PayloadType)` pairs into the `CommandBody`
/// enum, a `name()` accessor used for logging and timeouts, and a `From`
/// impl per payload so call sites can write `SessionInfo { .. }.into()`.
macro_rules! define_commands {
    ( $( ($variant:ident, $payload:ty) ),* $(,)? ) => {
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        pub enum CommandBody {
            $( $variant($payload), )*
        }

        impl CommandBody {
            /// The command's type name as it appears on the wire.
            pub fn name(&self) -> &'static str {
                match self {
                    $( CommandBody::$variant(_) => stringify!($variant), )*
                }
            }
        }

        $(
            impl From<$payload> for CommandBody {
                fn from(payload: $payload) -> Self {
                    CommandBody::$variant(payload)
                }
            }
        )*
    };
}
