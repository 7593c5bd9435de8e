use serde_json::{Map, Value};

use crate::error::CodecError;

/// A signalling message: a required `type` tag, an optional routing `id`,
/// and an open bag of additional fields the broker does not interpret.
///
/// `fields` never contains `"type"` or `"id"` — those are pulled out on
/// parse and re-inserted on serialize so round-tripping through a broker
/// that doesn't understand a given `type` still preserves every field.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub msg_type: String,
    pub id: Option<String>,
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            id: None,
            fields: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Sets `id` only if it is currently unset — used when forwarding a
    /// player's message to its streamer so the streamer can route replies.
    pub fn stamp_id_if_absent(&mut self, id: impl Into<String>) {
        if self.id.is_none() {
            self.id = Some(id.into());
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(raw)?;
        let mut obj = match value {
            Value::Object(map) => map,
            _ => return Err(CodecError::MissingField("type")),
        };

        let msg_type = match obj.remove("type") {
            Some(Value::String(s)) => s,
            _ => return Err(CodecError::MissingField("type")),
        };

        let id = match obj.remove("id") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(Self {
            msg_type,
            id,
            fields: obj,
        })
    }

    pub fn serialize(&self) -> String {
        let mut obj = Map::with_capacity(self.fields.len() + 2);
        obj.insert("type".to_string(), Value::String(self.msg_type.clone()));
        if let Some(id) = &self.id {
            obj.insert("id".to_string(), Value::String(id.clone()));
        }
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj).to_string()
    }
}

/// Canonical constructors for server-originated messages. Each one produces
/// exactly the flat shape the wire protocol specifies — these are the only
/// sanctioned way to build an outbound message other than forwarding an
/// incoming one verbatim.
pub mod canonical {
    use super::*;

    pub fn config() -> Envelope {
        Envelope::new("config").with_field("peerConnectionOptions", Value::Object(Map::new()))
    }

    pub fn ping() -> Envelope {
        Envelope::new("ping")
    }

    pub fn pong() -> Envelope {
        Envelope::new("pong")
    }

    pub fn player_count(count: u32) -> Envelope {
        Envelope::new("playerCount").with_field("count", count)
    }

    pub fn error(message: impl Into<String>) -> Envelope {
        Envelope::new("error").with_field("message", message.into())
    }

    pub fn streamer_list(ids: impl IntoIterator<Item = String>) -> Envelope {
        let ids: Vec<Value> = ids.into_iter().map(Value::String).collect();
        Envelope::new("streamerList").with_field("ids", Value::Array(ids))
    }

    pub fn player_connected(
        player_id: impl Into<String>,
        data_channel: bool,
        sfu: bool,
        send_offer: bool,
    ) -> Envelope {
        Envelope::new("playerConnected")
            .with_field("playerId", player_id.into())
            .with_field("dataChannel", data_channel)
            .with_field("sfu", sfu)
            .with_field("sendOffer", send_offer)
    }

    pub fn offer(sdp: impl Into<String>) -> Envelope {
        Envelope::new("offer").with_field("sdp", sdp.into())
    }

    pub fn answer(sdp: impl Into<String>) -> Envelope {
        Envelope::new("answer").with_field("sdp", sdp.into())
    }

    pub fn ice_candidate(candidate: Value) -> Envelope {
        Envelope::new("iceCandidate").with_field("candidate", candidate)
    }

    pub fn streamer_id_changed(new_id: impl Into<String>) -> Envelope {
        Envelope::new("streamerIdChanged").with_field("newID", new_id.into())
    }

    pub fn disconnect(reason: Option<String>) -> Envelope {
        let env = Envelope::new("disconnect");
        match reason {
            Some(r) => env.with_field("reason", r),
            None => env,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_envelope() {
        let env = Envelope::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.msg_type, "ping");
        assert!(env.id.is_none());
        assert!(env.fields.is_empty());
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(Envelope::parse(r#"{"sdp":"v=0"}"#).is_err());
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn numeric_id_is_stringified() {
        let env = Envelope::parse(r#"{"type":"offer","id":42,"sdp":"v=0"}"#).unwrap();
        assert_eq!(env.id.as_deref(), Some("42"));
    }

    #[test]
    fn unknown_fields_are_preserved_on_serialize() {
        let env = Envelope::parse(r#"{"type":"offer","sdp":"v=0","customThing":7}"#).unwrap();
        let out = env.serialize();
        let reparsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(reparsed["sdp"], "v=0");
        assert_eq!(reparsed["customThing"], 7);
    }

    #[test]
    fn stamp_id_if_absent_only_sets_when_unset() {
        let mut env = Envelope::new("offer");
        env.stamp_id_if_absent("abc");
        assert_eq!(env.id.as_deref(), Some("abc"));
        env.stamp_id_if_absent("xyz");
        assert_eq!(env.id.as_deref(), Some("abc"));
    }

    fn roundtrip(env: Envelope) {
        let out = env.serialize();
        let parsed = Envelope::parse(&out).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn canonical_roundtrips() {
        roundtrip(canonical::config());
        roundtrip(canonical::ping());
        roundtrip(canonical::pong());
        roundtrip(canonical::player_count(3));
        roundtrip(canonical::error("streamer at capacity"));
        roundtrip(canonical::streamer_list(vec!["a".into(), "b".into()]));
        roundtrip(canonical::player_connected("p1", true, false, true));
        roundtrip(canonical::offer("v=0..."));
        roundtrip(canonical::answer("v=0..."));
        roundtrip(canonical::ice_candidate(
            serde_json::json!({"candidate": "candidate:1 1 UDP", "sdpMid": "0"}),
        ));
        roundtrip(canonical::streamer_id_changed("streamer_abcd1234"));
        roundtrip(canonical::disconnect(Some("bye".into())));
        roundtrip(canonical::disconnect(None));
    }

    #[test]
    fn type_is_serialized_first() {
        let env = canonical::player_count(5);
        let out = env.serialize();
        assert!(out.starts_with(r#"{"type":"playerCount""#));
    }
}
