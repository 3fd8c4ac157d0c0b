use serde::{Deserialize, Deserializer, Serializer};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Serde helpers for `time::OffsetDateTime`.
///
/// Written as RFC 3339 in UTC (e.g. `2025-01-02T03:04:05Z`); any RFC 3339 offset is accepted
/// on input.
pub mod rfc3339 {
    use super::*;

    pub fn serialize<S>(dt: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(
            &dt.to_offset(time::UtcOffset::UTC)
                .format(&Rfc3339)
                .map_err(serde::ser::Error::custom)?,
        )
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        OffsetDateTime::parse(&raw, &Rfc3339).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for 128-bit fingerprints, kept as 32 lowercase hex digits so JSON readers
/// that only know 64-bit numbers do not mangle them.
pub mod hex_u128 {
    use super::*;

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:032x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        u128::from_str_radix(&raw, 16).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use time::macros::datetime;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Stamp {
        #[serde(with = "rfc3339")]
        at: OffsetDateTime,
        #[serde(with = "hex_u128")]
        id: u128,
    }

    #[test]
    fn writes_utc_and_hex() {
        let stamp = Stamp {
            at: datetime!(2025-01-02 03:04:05 +2),
            id: 0xdead_beef,
        };
        let json = serde_json::to_string(&stamp).unwrap();
        assert_eq!(
            json,
            r#"{"at":"2025-01-02T01:04:05Z","id":"000000000000000000000000deadbeef"}"#
        );
        assert_eq!(serde_json::from_str::<Stamp>(&json).unwrap(), stamp);
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Stamp>(r#"{"at":"yesterday","id":"0"}"#).is_err());
        let bad_hex = r#"{"at":"2025-01-02T01:04:05Z","id":"xyz"}"#;
        assert!(serde_json::from_str::<Stamp>(bad_hex).is_err());
    }
}
