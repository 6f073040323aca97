use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = humantime::format_duration(*duration).to_string();
    serializer.serialize_str(&s)
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Window {
        #[serde(
            serialize_with = "serialize_duration",
            deserialize_with = "deserialize_duration"
        )]
        every: Duration,
    }

    #[test]
    fn parses_humantime_strings() {
        let window: Window = serde_json::from_str(r#"{"every": "2m 30s"}"#).unwrap();
        assert_eq!(window.every, Duration::from_secs(150));
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Window>(r#"{"every": "soon"}"#).is_err());
    }

    #[test]
    fn serializes_back_to_humantime() {
        let window = Window {
            every: Duration::from_secs(90),
        };
        assert_eq!(
            serde_json::to_string(&window).unwrap(),
            r#"{"every":"1m 30s"}"#
        );
    }
}
