//! Genus → toxicity lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Toxicity class of a genus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToxicityCode {
    #[serde(rename = "P", alias = "poisonous")]
    Poisonous,
    #[serde(rename = "E", alias = "edible")]
    Edible,
    #[serde(rename = "U", alias = "unknown")]
    Unknown,
}

impl ToxicityCode {
    pub fn default_label(&self) -> &'static str {
        match self {
            ToxicityCode::Poisonous => "Poisonous",
            ToxicityCode::Edible => "Edible",
            ToxicityCode::Unknown => "Unknown",
        }
    }

    pub fn default_warning(&self) -> &'static str {
        match self {
            ToxicityCode::Poisonous => "WARNING: this genus contains poisonous species. Do not eat!",
            ToxicityCode::Edible => {
                "Likely edible, but always confirm the identification with an expert before eating"
            }
            ToxicityCode::Unknown => "Toxicity could not be determined for this genus",
        }
    }
}

/// One row of the toxicity table as supplied in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicityEntry {
    pub genus: String,
    pub code: ToxicityCode,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

impl ToxicityEntry {
    pub fn with_default_text(genus: &str, code: ToxicityCode) -> Self {
        Self {
            genus: genus.to_string(),
            code,
            label: None,
            warning: None,
        }
    }
}

/// Toxicity annotation attached to a predicted label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicityInfo {
    pub code: ToxicityCode,
    pub is_poisonous: bool,
    pub label: String,
    pub warning: String,
}

impl ToxicityInfo {
    fn from_code(code: ToxicityCode) -> Self {
        Self {
            code,
            is_poisonous: code == ToxicityCode::Poisonous,
            label: code.default_label().to_string(),
            warning: code.default_warning().to_string(),
        }
    }
}

/// One class in the catalogue listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub genus: String,
    pub toxicity: ToxicityInfo,
}

/// Every known class with its toxicity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassCatalogue {
    pub classes: Vec<ClassInfo>,
    pub total: usize,
    pub poisonous_count: usize,
    pub edible_count: usize,
}

/// Static class → toxicity map supplied at startup
#[derive(Debug, Clone, Default)]
pub struct ToxicityTable {
    entries: HashMap<String, ToxicityInfo>,
}

impl ToxicityTable {
    pub fn new(entries: &[ToxicityEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|entry| {
                let mut info = ToxicityInfo::from_code(entry.code);
                if let Some(label) = &entry.label {
                    info.label = label.clone();
                }
                if let Some(warning) = &entry.warning {
                    info.warning = warning.clone();
                }
                (entry.genus.clone(), info)
            })
            .collect();
        Self { entries }
    }

    /// Toxicity of `genus`; genera missing from the table are reported as unknown
    pub fn lookup(&self, genus: &str) -> ToxicityInfo {
        self.entries
            .get(genus)
            .cloned()
            .unwrap_or_else(|| ToxicityInfo::from_code(ToxicityCode::Unknown))
    }

    /// List `labels` in order with their toxicity
    pub fn catalogue(&self, labels: &[String]) -> ClassCatalogue {
        let classes: Vec<ClassInfo> = labels
            .iter()
            .map(|genus| ClassInfo {
                genus: genus.clone(),
                toxicity: self.lookup(genus),
            })
            .collect();
        let poisonous_count = classes
            .iter()
            .filter(|c| c.toxicity.code == ToxicityCode::Poisonous)
            .count();
        let edible_count = classes
            .iter()
            .filter(|c| c.toxicity.code == ToxicityCode::Edible)
            .count();

        ClassCatalogue {
            total: classes.len(),
            classes,
            poisonous_count,
            edible_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassesConfig;

    fn default_table() -> ToxicityTable {
        ToxicityTable::new(&ClassesConfig::default().toxicity)
    }

    #[test]
    fn test_poisonous_lookup() {
        let table = default_table();
        let amanita = table.lookup("Amanita");
        assert!(amanita.is_poisonous);
        assert_eq!(amanita.code, ToxicityCode::Poisonous);
        assert!(!amanita.warning.is_empty());

        assert!(!table.lookup("Boletus").is_poisonous);
        assert!(table.lookup("Inocybe").is_poisonous);
    }

    #[test]
    fn test_unknown_genus() {
        let table = default_table();
        let info = table.lookup("Morchella");
        assert_eq!(info.code, ToxicityCode::Unknown);
        assert!(!info.is_poisonous);
    }

    #[test]
    fn test_custom_text_overrides_default() {
        let table = ToxicityTable::new(&[ToxicityEntry {
            genus: "Amanita".to_string(),
            code: ToxicityCode::Poisonous,
            label: Some("Deadly".to_string()),
            warning: None,
        }]);
        let info = table.lookup("Amanita");
        assert_eq!(info.label, "Deadly");
        assert_eq!(info.warning, ToxicityCode::Poisonous.default_warning());
    }

    #[test]
    fn test_catalogue_counts() {
        let config = ClassesConfig::default();
        let catalogue = default_table().catalogue(&config.labels);
        assert_eq!(catalogue.total, 11);
        assert_eq!(catalogue.poisonous_count, 4);
        assert_eq!(catalogue.edible_count, 7);
        assert_eq!(catalogue.classes[1].genus, "Amanita");
    }

    #[test]
    fn test_code_deserialization() {
        let entry: ToxicityEntry =
            serde_json::from_str(r#"{"genus": "Russula", "code": "E"}"#).unwrap();
        assert_eq!(entry.code, ToxicityCode::Edible);
        let entry: ToxicityEntry =
            serde_json::from_str(r#"{"genus": "Amanita", "code": "poisonous"}"#).unwrap();
        assert_eq!(entry.code, ToxicityCode::Poisonous);
    }
}
