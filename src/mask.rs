//! Sensitive-field classification and masking policy.
//!
//! Classification (which data keys are sensitive) is a versioned data
//! structure, kept separate from the masking rule itself so either side can
//! be tested and replaced independently.

use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;

/// Mask glyph used for redacted characters.
pub const MASK_GLYPH: char = '\u{2022}';

/// Number of mask glyphs emitted ahead of the revealed tail.
const MASK_PREFIX_LEN: usize = 4;

/// Number of trailing characters a long value may reveal.
const REVEAL_TAIL_LEN: usize = 4;

/// Sensitivity classes attached to data keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityTag {
    TravelDocument,
    NationalId,
    TaxId,
}

/// One classification rule: a lowercase key fragment and the class it
/// assigns. Matching is case-insensitive substring containment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityRule {
    pub fragment: String,
    pub tag: SensitivityTag,
}

/// Versioned field-classification policy. The default set mirrors the
/// identifiers handled by the citizenship casework: passport numbers,
/// PESEL, SSN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityPolicy {
    pub version: u32,
    rules: Vec<SensitivityRule>,
}

impl Default for SensitivityPolicy {
    fn default() -> Self {
        let rule = |fragment: &str, tag: SensitivityTag| SensitivityRule {
            fragment: fragment.to_string(),
            tag,
        };
        Self {
            version: 1,
            rules: vec![
                rule("passportnumber", SensitivityTag::TravelDocument),
                rule("passport", SensitivityTag::TravelDocument),
                rule("pesel", SensitivityTag::NationalId),
                rule("nationalid", SensitivityTag::NationalId),
                rule("ssn", SensitivityTag::TaxId),
            ],
        }
    }
}

impl SensitivityPolicy {
    pub fn new(version: u32, rules: Vec<SensitivityRule>) -> Self {
        Self { version, rules }
    }

    /// Classifies a data key. The first matching rule wins.
    pub fn classify(&self, data_key: &str) -> Option<SensitivityTag> {
        let lower = data_key.to_lowercase();
        self.rules
            .iter()
            .find(|r| lower.contains(&r.fragment))
            .map(|r| r.tag)
    }

    /// Masks a value classified as sensitive, verifying its own output.
    ///
    /// Values longer than four characters keep their last four; anything
    /// shorter is replaced wholesale, revealing neither characters nor
    /// length. A failed self-check aborts the caller's whole operation
    /// rather than letting a partially masked value escape.
    pub fn mask(&self, data_key: &str, value: &str) -> Result<String, ProcessingError> {
        let masked = mask_value(value);
        self.verify_masked(data_key, value, &masked)?;
        Ok(masked)
    }

    fn verify_masked(
        &self,
        data_key: &str,
        original: &str,
        masked: &str,
    ) -> Result<(), ProcessingError> {
        if original.is_empty() {
            return Ok(());
        }
        let revealed: usize = masked.chars().filter(|c| *c != MASK_GLYPH).count();
        let limit = if original.chars().count() > REVEAL_TAIL_LEN {
            REVEAL_TAIL_LEN
        } else {
            0
        };
        if masked == original || revealed > limit {
            return Err(ProcessingError::MaskingFault(format!(
                "mask for key '{data_key}' reveals {revealed} characters (limit {limit})"
            )));
        }
        Ok(())
    }
}

/// The masking rule itself, independent of classification.
fn mask_value(value: &str) -> String {
    let prefix: String = std::iter::repeat(MASK_GLYPH).take(MASK_PREFIX_LEN).collect();
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > REVEAL_TAIL_LEN {
        let tail: String = chars[chars.len() - REVEAL_TAIL_LEN..].iter().collect();
        format!("{prefix}{tail}")
    } else {
        prefix
    }
}
