//! Difficulty profiles and session rules, loaded once and shared immutably.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::constants::{
    DEFAULT_SET_BONUS_FACTOR, MIN_TOP_UP_CENTS, SET_BOUNDARY_RISK_FACTOR, SET_SIZE, STEP_CAP,
};
use crate::money::{Cents, Multiplier};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be between {min:.2} and {max:.2} (got {value:.4})")]
    RangeViolation {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("{field} must be positive (got {value})")]
    NonPositive { field: &'static str, value: i64 },
    #[error("duplicate difficulty profile '{0}'")]
    DuplicateProfile(String),
    #[error("difficulty profile name must not be empty")]
    EmptyName,
    #[error("difficulty catalog must contain at least one profile")]
    EmptyCatalog,
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Static tuning for one difficulty level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyProfile {
    pub name: String,
    /// Per-step collision chance in `[0, 1]`.
    pub collision_probability: f64,
    pub starting_multiplier: f64,
    pub multiplier_increment: f64,
    #[serde(default = "DifficultyProfile::default_set_bonus_factor")]
    pub set_bonus_factor: f64,
    #[serde(default)]
    pub description: String,
}

impl DifficultyProfile {
    #[must_use]
    pub const fn default_set_bonus_factor() -> f64 {
        DEFAULT_SET_BONUS_FACTOR
    }

    fn table_entry(
        name: &str,
        collisions_in_25: u32,
        starting_multiplier: f64,
        multiplier_increment: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            collision_probability: f64::from(collisions_in_25) / 25.0,
            starting_multiplier,
            multiplier_increment,
            set_bonus_factor: DEFAULT_SET_BONUS_FACTOR,
            description: format!(
                "{collisions_in_25} in 25 chance of collision, starting multiplier of x{starting_multiplier:.2}"
            ),
        }
    }

    #[must_use]
    pub fn starting(&self) -> Multiplier {
        Multiplier::from_ratio(self.starting_multiplier)
    }

    #[must_use]
    pub fn increment(&self) -> Multiplier {
        Multiplier::from_ratio(self.multiplier_increment)
    }

    /// Validate ranges for a single profile.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        check_range("collision_probability", self.collision_probability, 0.0, 1.0)?;
        check_range("starting_multiplier", self.starting_multiplier, 0.01, 1_000.0)?;
        check_range("multiplier_increment", self.multiplier_increment, 0.0, 1_000.0)?;
        check_range("set_bonus_factor", self.set_bonus_factor, 1.0, 100.0)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::RangeViolation {
            field,
            min,
            max,
            value,
        })
    }
}

/// Immutable lookup of difficulty profiles keyed by lowercase name.
#[derive(Debug, Clone, PartialEq)]
pub struct DifficultyCatalog {
    profiles: BTreeMap<String, DifficultyProfile>,
}

#[derive(Deserialize)]
struct CatalogFile {
    difficulties: Vec<DifficultyProfile>,
}

impl DifficultyCatalog {
    /// Build a catalog, validating every profile.
    ///
    /// # Errors
    ///
    /// Returns an error for empty input, duplicate names, or out-of-range values.
    pub fn new(profiles: Vec<DifficultyProfile>) -> Result<Self, ConfigError> {
        if profiles.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }
        let mut map = BTreeMap::new();
        for profile in profiles {
            profile.validate()?;
            let key = profile.name.trim().to_ascii_lowercase();
            if map.contains_key(&key) {
                return Err(ConfigError::DuplicateProfile(profile.name));
            }
            map.insert(key, profile);
        }
        Ok(Self { profiles: map })
    }

    /// Parse `{"difficulties": [...]}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a profile is invalid.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile =
            serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::new(file.difficulties)
    }

    /// The Easy / Medium / Hard / Daredevil table.
    #[must_use]
    pub fn standard() -> Self {
        let profiles = vec![
            DifficultyProfile::table_entry("Easy", 1, 1.00, 0.10),
            DifficultyProfile::table_entry("Medium", 3, 1.09, 0.15),
            DifficultyProfile::table_entry("Hard", 5, 1.20, 0.20),
            DifficultyProfile::table_entry("Daredevil", 10, 1.60, 0.30),
        ];
        let mut map = BTreeMap::new();
        for profile in profiles {
            map.insert(profile.name.to_ascii_lowercase(), profile);
        }
        Self { profiles: map }
    }

    /// Case-insensitive lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DifficultyProfile> {
        self.profiles.get(&name.trim().to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DifficultyProfile> {
        self.profiles.values()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut profiles: Vec<&DifficultyProfile> = self.profiles.values().collect();
        profiles.sort_by(|a, b| a.collision_probability.total_cmp(&b.collision_probability));
        profiles.into_iter().map(|p| p.name.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Process-wide built-in catalog.
#[must_use]
pub fn standard_catalog() -> &'static DifficultyCatalog {
    static CATALOG: OnceLock<DifficultyCatalog> = OnceLock::new();
    CATALOG.get_or_init(DifficultyCatalog::standard)
}

/// Session rules shared by every difficulty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "RulesConfig::default_step_cap")]
    pub step_cap: u32,
    #[serde(default = "RulesConfig::default_set_size")]
    pub set_size: u32,
    /// Collision probability multiplier on set-completing steps.
    /// Pending product confirmation; 1.0 disables it.
    #[serde(default = "RulesConfig::default_set_boundary_risk_factor")]
    pub set_boundary_risk_factor: f64,
    #[serde(default = "RulesConfig::default_min_top_up")]
    pub min_top_up_cents: Cents,
}

impl RulesConfig {
    #[must_use]
    pub const fn default_step_cap() -> u32 {
        STEP_CAP
    }

    #[must_use]
    pub const fn default_set_size() -> u32 {
        SET_SIZE
    }

    #[must_use]
    pub const fn default_set_boundary_risk_factor() -> f64 {
        SET_BOUNDARY_RISK_FACTOR
    }

    #[must_use]
    pub const fn default_min_top_up() -> Cents {
        MIN_TOP_UP_CENTS
    }

    /// Parse rules from JSON, filling omitted fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a rule is out of range.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let rules: Self =
            serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }

    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_cap == 0 {
            return Err(ConfigError::NonPositive {
                field: "step_cap",
                value: 0,
            });
        }
        if self.set_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "set_size",
                value: 0,
            });
        }
        if self.min_top_up_cents <= 0 {
            return Err(ConfigError::NonPositive {
                field: "min_top_up_cents",
                value: self.min_top_up_cents,
            });
        }
        check_range(
            "set_boundary_risk_factor",
            self.set_boundary_risk_factor,
            0.0,
            10.0,
        )
    }

    /// Whether finishing step number `step` (1-based) closes a set.
    #[must_use]
    pub const fn completes_set(&self, step: u32) -> bool {
        step > 0 && step % self.set_size == 0
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            step_cap: STEP_CAP,
            set_size: SET_SIZE,
            set_boundary_risk_factor: SET_BOUNDARY_RISK_FACTOR,
            min_top_up_cents: MIN_TOP_UP_CENTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_matches_table() {
        let catalog = standard_catalog();
        assert_eq!(catalog.len(), 4);
        let easy = catalog.get("easy").expect("easy profile");
        assert_eq!(easy.name, "Easy");
        assert!((easy.collision_probability - 0.04).abs() < 1e-12);
        assert_eq!(easy.starting(), Multiplier::ONE);
        assert_eq!(easy.increment().basis_points(), 1_000);

        let daredevil = catalog.get(" DAREDEVIL ").expect("daredevil profile");
        assert_eq!(daredevil.starting().basis_points(), 16_000);
        assert_eq!(daredevil.increment().basis_points(), 3_000);
        assert!(daredevil.description.starts_with("10 in 25"));
        assert_eq!(
            catalog.names(),
            vec!["Easy", "Medium", "Hard", "Daredevil"]
        );
    }

    #[test]
    fn catalog_from_json_applies_defaults() {
        let json = r#"{
            "difficulties": [
                {
                    "name": "Practice",
                    "collision_probability": 0.0,
                    "starting_multiplier": 1.0,
                    "multiplier_increment": 0.05
                }
            ]
        }"#;
        let catalog = DifficultyCatalog::from_json(json).unwrap();
        let practice = catalog.get("practice").unwrap();
        assert!((practice.set_bonus_factor - DEFAULT_SET_BONUS_FACTOR).abs() < 1e-12);
        assert!(catalog.get("Easy").is_none());
    }

    #[test]
    fn catalog_rejects_bad_profiles() {
        let mut bad = DifficultyCatalog::standard().get("Easy").unwrap().clone();
        bad.collision_probability = 1.5;
        assert!(matches!(
            DifficultyCatalog::new(vec![bad]),
            Err(ConfigError::RangeViolation {
                field: "collision_probability",
                ..
            })
        ));

        let easy = DifficultyCatalog::standard().get("Easy").unwrap().clone();
        let mut shouty = easy.clone();
        shouty.name = "EASY".to_string();
        assert_eq!(
            DifficultyCatalog::new(vec![easy, shouty]),
            Err(ConfigError::DuplicateProfile("EASY".to_string()))
        );
        assert_eq!(DifficultyCatalog::new(Vec::new()), Err(ConfigError::EmptyCatalog));
        assert!(matches!(
            DifficultyCatalog::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rules_defaults_and_set_boundaries() {
        let rules = RulesConfig::from_json("{}").unwrap();
        assert_eq!(rules, RulesConfig::default());
        assert!(!rules.completes_set(0));
        assert!(!rules.completes_set(5));
        assert!(rules.completes_set(6));
        assert!(rules.completes_set(24));
        assert!(!rules.completes_set(25));
    }

    #[test]
    fn rules_reject_zero_cap() {
        let err = RulesConfig::from_json(r#"{"step_cap": 0}"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::NonPositive {
                field: "step_cap",
                value: 0
            }
        );
    }
}
