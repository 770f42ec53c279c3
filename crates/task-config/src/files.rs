//! Local and remote file references shared by every container variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A file on local disk, addressed by directory and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileRef {
    pub dir: String,
    pub name: String,
    /// Absence of the file is tolerated at upload time.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl LocalFileRef {
    pub fn new(dir: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.dir).join(&self.name)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }
}

/// Result files declared by the image, either positional or keyed.
///
/// Positional lists are zipped with the controller's result descriptors;
/// keyed maps are addressed through each descriptor's `local_result_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalResultFiles {
    List(Vec<LocalFileRef>),
    Keyed(BTreeMap<String, LocalFileRef>),
}

impl LocalResultFiles {
    pub fn len(&self) -> usize {
        match self {
            LocalResultFiles::List(files) => files.len(),
            LocalResultFiles::Keyed(files) => files.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, LocalResultFiles::Keyed(_))
    }

    pub fn refs(&self) -> Vec<&LocalFileRef> {
        match self {
            LocalResultFiles::List(files) => files.iter().collect(),
            LocalResultFiles::Keyed(files) => files.values().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&LocalFileRef> {
        match self {
            LocalResultFiles::List(_) => None,
            LocalResultFiles::Keyed(files) => files.get(key),
        }
    }
}

impl Default for LocalResultFiles {
    fn default() -> Self {
        LocalResultFiles::List(Vec::new())
    }
}

/// An addressable remote file, handed to the connector named by `connector_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileDescriptor {
    pub connector_type: String,
    #[serde(default)]
    pub connector_access: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub add_meta_data: bool,
    /// Key into a keyed `local_result_files` map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_result_file: Option<String>,
}

impl RemoteFileDescriptor {
    pub fn new(connector_type: impl Into<String>, connector_access: Value) -> Self {
        Self {
            connector_type: connector_type.into(),
            connector_access,
            add_meta_data: false,
            local_result_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_result_files_accepts_both_forms() {
        let list: LocalResultFiles =
            serde_json::from_value(json!([{"dir": "/out", "name": "a.txt"}])).unwrap();
        assert!(!list.is_keyed());
        assert_eq!(list.len(), 1);

        let keyed: LocalResultFiles = serde_json::from_value(json!({
            "summary": {"dir": "/out", "name": "summary.json", "optional": true}
        }))
        .unwrap();
        assert!(keyed.is_keyed());
        assert!(keyed.get("summary").unwrap().optional);
        assert!(keyed.get("missing").is_none());
    }

    #[test]
    fn local_file_ref_joins_path() {
        let file = LocalFileRef::new("/var/tmp", "data.bin");
        assert_eq!(file.path(), PathBuf::from("/var/tmp/data.bin"));
        assert!(!file.optional);
        assert!(file.optional().optional);
    }
}
