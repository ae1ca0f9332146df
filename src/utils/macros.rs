macro_rules! string_enum {
    ($vis:vis enum $name:ident { $($item:ident => $str:expr,)* }) => {
        #[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
        $vis enum $name {
            $($item,)*
        }

        impl ::std::str::FromStr for $name {
            type Err = ::anyhow::Error;

            fn from_str(s: &str) -> ::anyhow::Result<$name> {
                match s {
                    $($str => Ok($name::$item),)*
                    s => ::anyhow::bail!("invalid {}: {}", stringify!($name), s),
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "{}", self.to_str())
            }
        }

        impl $name {
            #[allow(dead_code)]
            $vis fn to_str(&self) -> &'static str {
                match *self {
                    $($name::$item => $str,)*
                }
            }

            #[allow(dead_code)]
            $vis fn possible_values() -> &'static [&'static str] {
                &[$($str,)*]
            }
        }

        impl<'de> ::serde::de::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: ::serde::de::Deserializer<'de>,
            {
                let input = <::std::string::String as ::serde::de::Deserialize>::deserialize(
                    deserializer,
                )?;
                input.parse().map_err(::serde::de::Error::custom)
            }
        }

        impl ::serde::ser::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: ::serde::ser::Serializer,
            {
                serializer.serialize_str(self.to_str())
            }
        }
    }
}
