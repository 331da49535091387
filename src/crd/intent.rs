//! Typed intents carried on resource status
//!
//! Control-flow signals such as "detach requested" travel between
//! reconcilers on the persisted resources. In code they are an enum; on the
//! wire they stay plain annotation keys so older controllers can read them.

use std::collections::BTreeMap;

/// A signal attached to a DiskVolume or DiskVolumeAttachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Intent {
    /// The attachment must be detached and removed
    DetachRequest,
    /// The provider disk must be deleted together with the volume
    DeleteRequest,
    /// A replica attachment is being promoted to primary
    PromoteRequest,
    /// A primary attachment is being demoted to replica
    DemoteRequest,
    /// The resource was reset by crash recovery
    Recovered,
    /// The volume was declared inline in a pod spec
    InlineVolume,
    /// Attach retries were exhausted
    AttachFailed,
}

impl Intent {
    pub const ALL: [Intent; 7] = [
        Intent::DetachRequest,
        Intent::DeleteRequest,
        Intent::PromoteRequest,
        Intent::DemoteRequest,
        Intent::Recovered,
        Intent::InlineVolume,
        Intent::AttachFailed,
    ];

    /// Annotation key used at the persistence boundary
    pub fn key(&self) -> &'static str {
        match self {
            Intent::DetachRequest => "disk.replicated.io/volume-detach-request",
            Intent::DeleteRequest => "disk.replicated.io/volume-delete-request",
            Intent::PromoteRequest => "disk.replicated.io/promote-request",
            Intent::DemoteRequest => "disk.replicated.io/demote-request",
            Intent::Recovered => "disk.replicated.io/recovered",
            Intent::InlineVolume => "disk.replicated.io/inline-volume",
            Intent::AttachFailed => "disk.replicated.io/attach-failed",
        }
    }

    pub fn from_key(key: &str) -> Option<Intent> {
        Self::ALL.iter().copied().find(|i| i.key() == key)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Typed access to the intents stored in an annotation map
pub trait IntentSet {
    fn has_intent(&self, intent: Intent) -> bool;
    fn intent_value(&self, intent: Intent) -> Option<&str>;
    fn set_intent(&mut self, intent: Intent, value: impl Into<String>);
    fn clear_intent(&mut self, intent: Intent) -> bool;
    fn intents(&self) -> Vec<Intent>;
}

impl IntentSet for BTreeMap<String, String> {
    fn has_intent(&self, intent: Intent) -> bool {
        self.contains_key(intent.key())
    }

    fn intent_value(&self, intent: Intent) -> Option<&str> {
        self.get(intent.key()).map(String::as_str)
    }

    fn set_intent(&mut self, intent: Intent, value: impl Into<String>) {
        self.insert(intent.key().to_string(), value.into());
    }

    fn clear_intent(&mut self, intent: Intent) -> bool {
        self.remove(intent.key()).is_some()
    }

    fn intents(&self) -> Vec<Intent> {
        self.keys().filter_map(|k| Intent::from_key(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_round_trip_through_annotations() {
        let mut annotations = BTreeMap::new();
        annotations.insert("unrelated".to_string(), "x".to_string());
        annotations.set_intent(Intent::DetachRequest, "pod-controller");

        assert!(annotations.has_intent(Intent::DetachRequest));
        assert_eq!(
            annotations.intent_value(Intent::DetachRequest),
            Some("pod-controller")
        );
        assert_eq!(annotations.intents(), vec![Intent::DetachRequest]);

        assert!(annotations.clear_intent(Intent::DetachRequest));
        assert!(!annotations.clear_intent(Intent::DetachRequest));
        assert!(annotations.intents().is_empty());
    }

    #[test]
    fn test_keys_are_unique() {
        for intent in Intent::ALL {
            assert_eq!(Intent::from_key(intent.key()), Some(intent));
        }
    }
}
