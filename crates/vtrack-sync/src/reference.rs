//! Curated lookup tables kept as data files rather than code.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use vtrack_adapters::wait_times::{normalize_code, CategoryCodes};
use vtrack_core::VisaCategory;

pub const CITY_ALIASES_FILE: &str = "city_aliases.yaml";
pub const VISA_CATEGORIES_FILE: &str = "visa_categories.yaml";

/// Raw wait-time city text → gazetteer `ascii_name`.
pub type CityAliasTable = BTreeMap<String, String>;

#[derive(Debug, Deserialize)]
struct CityAliasesFile {
    aliases: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct VisaCategoriesFile {
    categories: Vec<CategoryEntry>,
}

#[derive(Debug, Deserialize)]
struct CategoryEntry {
    code: String,
    category: VisaCategory,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub aliases: CityAliasTable,
    pub codes: CategoryCodes,
}

impl ReferenceData {
    pub fn load(reference_dir: &Path) -> Result<Self> {
        let aliases_path = reference_dir.join(CITY_ALIASES_FILE);
        let aliases = parse_city_aliases(
            &std::fs::read_to_string(&aliases_path)
                .with_context(|| format!("reading {}", aliases_path.display()))?,
        )
        .with_context(|| format!("parsing {}", aliases_path.display()))?;

        let codes_path = reference_dir.join(VISA_CATEGORIES_FILE);
        let codes = parse_category_codes(
            &std::fs::read_to_string(&codes_path)
                .with_context(|| format!("reading {}", codes_path.display()))?,
        )
        .with_context(|| format!("parsing {}", codes_path.display()))?;

        Ok(Self { aliases, codes })
    }
}

pub fn parse_city_aliases(text: &str) -> Result<CityAliasTable> {
    let file: CityAliasesFile = serde_yaml::from_str(text)?;
    Ok(file.aliases)
}

pub fn parse_category_codes(text: &str) -> Result<CategoryCodes> {
    let file: VisaCategoriesFile = serde_yaml::from_str(text)?;
    let mut codes = CategoryCodes::new();
    for entry in file.categories {
        let code = normalize_code(&entry.code);
        if let Some(previous) = codes.insert(code.clone(), entry.category) {
            anyhow::bail!("code `{code}` mapped twice ({previous:?} and {:?})", entry.category);
        }
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_data_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../data")
    }

    #[test]
    fn category_codes_are_whitespace_normalized() {
        let codes = parse_category_codes(
            "categories:\n  - code: \"H, L, O, P, Q\"\n    category: petition_based_workers\n",
        )
        .unwrap();
        assert_eq!(codes.get("H,L,O,P,Q"), Some(&VisaCategory::PetitionBasedWorkers));
    }

    #[test]
    fn duplicate_codes_are_rejected() {
        let text = "categories:\n  - code: F,M,J\n    category: student_exchange\n  - code: \"F, M, J\"\n    category: visitors\n";
        assert!(parse_category_codes(text).is_err());
    }

    #[test]
    fn shipped_reference_files_load() {
        let reference = ReferenceData::load(&workspace_data_dir()).unwrap();
        assert_eq!(reference.aliases.get("Kuwait").map(String::as_str), Some("Kuwait City"));
        assert_eq!(
            reference.aliases.get("Mumbai (Bombay)").map(String::as_str),
            Some("Mumbai")
        );
        assert_eq!(reference.codes.len(), 4);
        for category in VisaCategory::ALL {
            assert!(reference.codes.values().any(|c| *c == category));
        }
    }
}
