//! Remote participant directory: wire types and the transport trait.

use async_trait::async_trait;
use nerdhub_crypto::{PublicKey, Signature};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DirectoryError;

/// Server-visible projection of a device's prekey bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    /// Base64 public identity key.
    pub pub_identity_key: String,
    /// Base64 public signed prekey.
    pub pub_signed_prekey: String,
    /// Base64 XEdDSA signature.
    pub signed_prekey_signature: String,
}

impl ParticipantRecord {
    /// Whether the published keys are exactly `bundle`.
    pub fn matches(&self, bundle: &PublishBundleRequest) -> bool {
        self.pub_identity_key == bundle.pub_identity_key
            && self.pub_signed_prekey == bundle.pub_signed_prekey
            && self.signed_prekey_signature == bundle.signed_prekey_signature
    }
}

/// Body of participant creation and bundle update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBundleRequest {
    pub pub_identity_key: String,
    #[serde(rename = "pubSignedPreKey")]
    pub pub_signed_prekey: String,
    #[serde(rename = "signedPreKeySignature")]
    pub signed_prekey_signature: String,
}

impl PublishBundleRequest {
    pub fn new(identity_key: &PublicKey, signed_prekey: &PublicKey, signature: &Signature) -> Self {
        Self {
            pub_identity_key: identity_key.to_base64(),
            pub_signed_prekey: signed_prekey.to_base64(),
            signed_prekey_signature: signature.to_base64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnetimePreKeyUpload {
    pub id: String,
    pub pub_key: String,
}

/// A onetime prekey as the directory reports it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedOnetimePreKey {
    pub id: String,
    pub pub_key: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Server-side handling of an onetime prekey upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Replace the participant's whole set.
    Flush,
    /// Add to the existing set.
    Append,
}

/// Per-request authentication material.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: String,
    pub device_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMeResponse {
    #[serde(default)]
    pub e2ee_participant: Option<ParticipantRecord>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn create_participant(
        &self,
        creds: &Credentials,
        user_id: &str,
        bundle: &PublishBundleRequest,
    ) -> Result<ParticipantRecord, DirectoryError>;

    async fn update_prekey_bundle(
        &self,
        creds: &Credentials,
        user_id: &str,
        participant_id: &str,
        bundle: &PublishBundleRequest,
    ) -> Result<ParticipantRecord, DirectoryError>;

    async fn create_onetime_prekeys(
        &self,
        creds: &Credentials,
        user_id: &str,
        participant_id: &str,
        keys: &[OnetimePreKeyUpload],
        mode: UploadMode,
    ) -> Result<Vec<PublishedOnetimePreKey>, DirectoryError>;

    /// A fresh token whose claims include the participant.
    async fn fetch_access_token(&self, creds: &Credentials) -> Result<String, DirectoryError>;

    /// The participant registered for the authenticated device, if any.
    async fn fetch_participant(
        &self,
        creds: &Credentials,
    ) -> Result<Option<ParticipantRecord>, DirectoryError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Int(i64),
    Uint(u64),
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Int(n) => n.to_string(),
        StringOrNumber::Uint(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_ids_accept_numbers_and_strings() {
        let numeric: ParticipantRecord = serde_json::from_str(
            r#"{"id": 12, "user_id": 3, "device_id": "d", "pub_identity_key": "a",
                "pub_signed_prekey": "b", "signed_prekey_signature": "c",
                "created_at": "2024-01-01"}"#,
        )
        .unwrap();
        assert_eq!(numeric.id, "12");
        assert_eq!(numeric.user_id, "3");

        let textual: ParticipantRecord = serde_json::from_str(
            r#"{"id": "12", "pub_identity_key": "a", "pub_signed_prekey": "b",
                "signed_prekey_signature": "c"}"#,
        )
        .unwrap();
        assert_eq!(textual.id, "12");
        assert_eq!(textual.user_id, "");
    }

    #[test]
    fn publish_request_uses_camel_case() {
        let body = PublishBundleRequest {
            pub_identity_key: "a".into(),
            pub_signed_prekey: "b".into(),
            signed_prekey_signature: "c".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["pubIdentityKey"], "a");
        assert_eq!(json["pubSignedPreKey"], "b");
        assert_eq!(json["signedPreKeySignature"], "c");

        let upload = serde_json::to_value(OnetimePreKeyUpload {
            id: "x".into(),
            pub_key: "y".into(),
        })
        .unwrap();
        assert_eq!(upload["pubKey"], "y");
    }

    #[test]
    fn auth_me_tolerates_missing_participant() {
        let empty: AuthMeResponse = serde_json::from_str(r#"{"e2eeParticipant": null}"#).unwrap();
        assert!(empty.e2ee_participant.is_none());
        let absent: AuthMeResponse = serde_json::from_str(r#"{"user": {}}"#).unwrap();
        assert!(absent.e2ee_participant.is_none());
    }

    #[test]
    fn record_matches_identical_bundle() {
        let body = PublishBundleRequest {
            pub_identity_key: "a".into(),
            pub_signed_prekey: "b".into(),
            signed_prekey_signature: "c".into(),
        };
        let mut record = ParticipantRecord {
            id: "1".into(),
            user_id: "u".into(),
            device_id: String::new(),
            pub_identity_key: "a".into(),
            pub_signed_prekey: "b".into(),
            signed_prekey_signature: "c".into(),
        };
        assert!(record.matches(&body));
        record.pub_signed_prekey = "z".into();
        assert!(!record.matches(&body));
    }
}
