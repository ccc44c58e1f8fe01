//! Names of the popularity SQL objects per media type.
//!
//! The standardized popularity score is computed by database functions owned
//! elsewhere; this module only knows their names so a batched update can
//! recompute the stored score with a plain set clause.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Column holding the precomputed score on media tables.
pub const STANDARDIZED_POPULARITY_COLUMN: &str = "standardized_popularity";
const PROVIDER_COLUMN: &str = "provider";
const META_DATA_COLUMN: &str = "meta_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Audio,
}

impl MediaType {
    pub const ALL: [MediaType; 2] = [MediaType::Image, MediaType::Audio];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            other => Err(format!("unknown media type `{other}` (expected image or audio)")),
        }
    }
}

/// SQL object names backing popularity for one media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularitySql {
    pub media_table: String,
    pub metrics_table: String,
    pub standardized_popularity_fn: String,
    pub popularity_percentile_fn: String,
}

impl PopularitySql {
    pub fn for_media(media_type: MediaType) -> Self {
        let media = media_type.as_str();
        Self {
            media_table: media.to_string(),
            metrics_table: format!("{media}_popularity_metrics"),
            standardized_popularity_fn: format!("standardized_{media}_popularity"),
            popularity_percentile_fn: format!("{media}_popularity_percentile"),
        }
    }

    /// Set clause recomputing the stored score from the current metrics.
    pub fn standardized_popularity_set_clause(&self) -> String {
        format!(
            "SET {STANDARDIZED_POPULARITY_COLUMN} = {func}({table}.{PROVIDER_COLUMN}, {table}.{META_DATA_COLUMN})",
            func = self.standardized_popularity_fn,
            table = self.media_table,
        )
    }

    /// Predicate restricting a recompute to one provider.
    pub fn provider_predicate(provider: &str) -> String {
        format!("WHERE {PROVIDER_COLUMN} = '{}'", provider.replace('\'', "''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_set_clause_uses_audio_function_and_table() {
        let sql = PopularitySql::for_media(MediaType::Audio);
        assert_eq!(
            sql.standardized_popularity_set_clause(),
            "SET standardized_popularity = standardized_audio_popularity(audio.provider, audio.meta_data)"
        );
        assert_eq!(sql.metrics_table, "audio_popularity_metrics");
    }

    #[test]
    fn provider_predicate_escapes_quotes() {
        assert_eq!(
            PopularitySql::provider_predicate("o'brien"),
            "WHERE provider = 'o''brien'"
        );
    }

    #[test]
    fn media_type_parses_case_insensitively() {
        assert_eq!("IMAGE".parse::<MediaType>(), Ok(MediaType::Image));
        assert!("video".parse::<MediaType>().is_err());
    }
}
