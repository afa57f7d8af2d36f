// Direktiv core
//
// Shared domain model for every other crate in the workspace.
//
// Key design decisions:
// - Entity types (Namespace, File, InstanceData, Variable) carry no storage or transport
// - Workflow YAML is parsed and validated once; a Workflow value is always well formed
// - Error taxonomy (ErrorKind) and workflow error codes live here so HTTP layers agree
// - Telemetry and env configuration are initialized from here by the binary

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod file;
pub mod instance;
pub mod manifest;
pub mod namespace;
pub mod secret;
pub mod telemetry;
pub mod variable;
pub mod workflow;

pub use clock::Clock;
pub use config::{AppKind, Config, ConfigError, FunctionsBackend};
pub use error::{codes, Classify, ErrorBody, ErrorKind, ErrorResponse, WorkflowError};
pub use file::{File, FileKind};
pub use instance::{InstanceData, InstanceLog, InstanceStatus, Invoker, ParentRef};
pub use namespace::{validate_name, Namespace};
pub use secret::SecretMeta;
pub use variable::{VarOwner, VarScope, Variable, VariableMeta};
pub use workflow::Workflow;

/// Serde adapter writing byte payloads as standard base64 strings
pub mod bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match bytes {
                Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => STANDARD
                    .decode(s.as_bytes())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Wrap {
            #[serde(with = "super")]
            data: Vec<u8>,
        }

        #[test]
        fn test_bytes_as_base64() {
            let w = Wrap {
                data: b"hello".to_vec(),
            };
            let json = serde_json::to_string(&w).unwrap();
            assert_eq!(json, r#"{"data":"aGVsbG8="}"#);
            assert_eq!(serde_json::from_str::<Wrap>(&json).unwrap(), w);
        }
    }
}
