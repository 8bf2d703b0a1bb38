use derive_more::{Display, From};
use std::str::FromStr;
use uuid::{self, Uuid};

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize, From)]
#[serde(transparent)]
/// A unique random participant identifier, assigned by the coordinator at rendezvous.
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Return a new random participant identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ParticipantId {
    type Err = uuid::Error;
    fn from_str(uuid_str: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(uuid_str)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display_roundtrip() {
        let id = ParticipantId::new();
        assert_eq!(id.to_string().parse::<ParticipantId>().unwrap(), id);
        assert!("not-a-uuid".parse::<ParticipantId>().is_err());
    }

    #[test]
    fn test_serialized_as_plain_string() {
        let id = ParticipantId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
