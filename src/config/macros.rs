/// Define a configuration section with embedded defaults
///
/// ```rust,ignore
/// config_struct! {
///     /// Reconnection policy
///     pub struct ReconnectConfig {
///         enabled: bool = true,
///         max_attempts: u32 = 10,
///     }
/// }
/// ```
///
/// Generates the struct with public fields, serde support with
/// `#[serde(default)]` so partial TOML sections work, a `Default` impl built
/// from the declared values, and `FIELD_NAMES` listing the accepted keys
/// (used to warn about typos in config files).
#[macro_export]
macro_rules! config_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_name:ident: $field_type:ty = $default_value:expr
            ),*
            $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(default)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field_name: $field_type,
            )*
        }

        impl $name {
            /// Keys accepted in this section
            pub const FIELD_NAMES: &'static [&'static str] = &[$(stringify!($field_name)),*];
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $(
                        $field_name: $default_value,
                    )*
                }
            }
        }
    };
}
