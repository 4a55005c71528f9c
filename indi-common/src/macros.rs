/// Declares an enum whose members are carried on the wire as fixed strings.
///
/// Generates `as_str`, `ALL`, `Display`, serde renames, and a `FromStr` that
/// rejects anything outside the listed members with [`ModelError::Value`].
///
/// [`ModelError::Value`]: crate::ModelError::Value
macro_rules! wire_enum {
    (
        $( #[ $meta:meta ] )*
        pub enum $ident:ident ($what:literal) {
            $( $( #[ $vmeta:meta ] )* $variant:ident = $wire:literal ),+ $(,)?
        }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        $( #[ $meta ] )*
        pub enum $ident {
            $(
                $( #[ $vmeta ] )*
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $ident {
            pub const ALL: &[Self] = &[$( Self::$variant ),+];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $wire, )+
                }
            }
        }

        impl ::core::str::FromStr for $ident {
            type Err = $crate::ModelError;

            fn from_str(s: &str) -> ::core::result::Result<Self, Self::Err> {
                match s.trim() {
                    $( $wire => Ok(Self::$variant), )+
                    _ => Err($crate::ModelError::value($what, s)),
                }
            }
        }

        impl ::core::fmt::Display for $ident {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use wire_enum;

#[cfg(test)]
mod tests {
    use crate::ModelError;

    wire_enum! {
        pub enum Weather ("weather") {
            Clear = "clear",
            /// Not observable
            Cloudy = "Cloudy",
        }
    }

    #[test]
    fn wire_enums() {
        assert_eq!(Weather::ALL, &[Weather::Clear, Weather::Cloudy]);
        assert_eq!(Weather::Cloudy.as_str(), "Cloudy");
        assert_eq!(Weather::Clear.to_string(), "clear");
        assert_eq!(" clear\n".parse::<Weather>().unwrap(), Weather::Clear);
        assert_eq!(
            "cloudy".parse::<Weather>(),
            Err(ModelError::Value { what: "weather", value: "cloudy".into() })
        );
        assert_eq!(serde_json::to_value(Weather::Cloudy).unwrap(), serde_json::json!("Cloudy"));
    }
}
